//! Shared hyper body plumbing for all HTTP-family listeners.

use bytes::Bytes;
use futures_util::stream;
use http_body_util::combinators::BoxBody as HttpBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use tokio::sync::mpsc;

/// Unified response body type: fixed or streamed, never erroring.
pub type BoxBody = HttpBoxBody<Bytes, std::convert::Infallible>;

/// A complete in-memory body.
pub fn full(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).boxed()
}

pub fn empty() -> BoxBody {
    full(Bytes::new())
}

/// A body fed frame-by-frame from a channel. Dropping the response (client
/// disconnect) closes the channel, which cancels the producer task on its
/// next send.
pub fn channel_body(rx: mpsc::Receiver<Frame<Bytes>>) -> BoxBody {
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, std::convert::Infallible>(frame), rx))
    });
    StreamBody::new(stream).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn channel_body_yields_frames_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let body = channel_body(rx);

        tx.send(Frame::data(Bytes::from_static(b"one"))).await.unwrap();
        tx.send(Frame::data(Bytes::from_static(b"two"))).await.unwrap();
        drop(tx);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"onetwo");
    }
}
