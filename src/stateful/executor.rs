//! Multi-step custom operations over stateful resources.
//!
//! A pipeline of read/create/update/delete/set steps runs atomically: every
//! resource the operation names is locked up front, in name order so two
//! concurrent operations can never deadlock, and stays locked until the last
//! step finishes. Failures restore the pre-operation state of every involved
//! resource before the locks release.
//!
//! Step parameters are expressions over the accumulated context: `input.*`
//! from the request payload plus variables bound by earlier steps. The
//! expression language covers field paths, literals, arithmetic, comparison
//! and boolean operators — enough for flows like TransferFunds:
//!
//! ```yaml
//! steps:
//!   - type: read
//!     resource: accounts
//!     id: input.from
//!     as: source
//!   - type: set
//!     var: ok
//!     value: source.balance >= input.amount
//!   - type: update
//!     resource: accounts
//!     id: input.from
//!     set: { balance: source.balance - input.amount }
//! ```

use super::resource::ResourceInner;
use super::{Resource, StateStore, StatefulError};
use parking_lot::MutexGuard;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Step kinds in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Read,
    List,
    Create,
    Update,
    Delete,
    Set,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepKind::Read => "read",
            StepKind::List => "list",
            StepKind::Create => "create",
            StepKind::Update => "update",
            StepKind::Delete => "delete",
            StepKind::Set => "set",
        };
        f.write_str(s)
    }
}

/// One step in a custom operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStep {
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    /// Expression resolving to the item id (read/update/delete).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Variable to bind the result under (read/create/update/list).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub r#as: String,
    /// field -> expression for create/update steps.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub set: HashMap<String, String>,
    /// Variable name for set steps.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub var: String,
    /// Value expression for set steps. A falsy boolean aborts the operation,
    /// which is how guards like balance checks are expressed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Abort when the value expression is false (guard step).
    #[serde(default)]
    pub require: bool,
}

/// A named multi-step pipeline from the config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomOperation {
    pub name: String,
    pub steps: Vec<OperationStep>,
    /// key -> expression map building the response payload. When empty, all
    /// bound variables except `input` are returned.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub response: HashMap<String, String>,
}

/// Execute an operation against the store.
pub(super) fn execute(
    store: &StateStore,
    op: &CustomOperation,
    input: Value,
) -> Result<Value, StatefulError> {
    // Resolve the involved resources and lock them in name order.
    let mut names: Vec<&str> = op
        .steps
        .iter()
        .filter(|s| !s.resource.is_empty())
        .map(|s| s.resource.as_str())
        .collect();
    names.sort_unstable();
    names.dedup();

    let mut resources: Vec<Arc<Resource>> = Vec::with_capacity(names.len());
    for name in &names {
        let resource = store
            .get(name)
            .ok_or_else(|| StatefulError::ResourceNotFound(name.to_string()))?;
        resources.push(resource);
    }

    let mut guards: HashMap<String, MutexGuard<'_, ResourceInner>> = HashMap::new();
    for resource in &resources {
        guards.insert(resource.name().to_string(), resource.inner.lock());
    }
    let by_name: HashMap<&str, &Arc<Resource>> =
        resources.iter().map(|r| (r.name(), r)).collect();

    // Snapshot for rollback: restore on any step failure.
    let snapshots: HashMap<String, Vec<super::ResourceItem>> = guards
        .iter()
        .map(|(name, guard)| (name.clone(), guard.items.clone()))
        .collect();

    let mut ctx: HashMap<String, Value> = HashMap::new();
    ctx.insert("input".to_string(), input);

    let result = run_steps(op, &by_name, &mut guards, &mut ctx);

    match result {
        Ok(()) => {
            let mut response = serde_json::Map::new();
            if op.response.is_empty() {
                for (k, v) in &ctx {
                    if k != "input" {
                        response.insert(k.clone(), v.clone());
                    }
                }
            } else {
                for (key, expr) in &op.response {
                    let value = eval(expr, &ctx).unwrap_or(Value::Null);
                    response.insert(key.clone(), value);
                }
            }
            Ok(Value::Object(response))
        }
        Err(e) => {
            for (name, items) in snapshots {
                if let Some(guard) = guards.get_mut(&name) {
                    guard.items = items;
                }
            }
            Err(e)
        }
    }
}

fn run_steps(
    op: &CustomOperation,
    resources: &HashMap<&str, &Arc<Resource>>,
    guards: &mut HashMap<String, MutexGuard<'_, ResourceInner>>,
    ctx: &mut HashMap<String, Value>,
) -> Result<(), StatefulError> {
    for (index, step) in op.steps.iter().enumerate() {
        let fail = |message: String| StatefulError::StepFailed {
            step: index,
            kind: step.kind.to_string(),
            message,
        };

        match step.kind {
            StepKind::Read => {
                let resource = resources
                    .get(step.resource.as_str())
                    .ok_or_else(|| fail(format!("resource {} not found", step.resource)))?;
                let id = eval_to_string(&step.id, ctx).map_err(&fail)?;
                let guard = guards.get(resource.name()).expect("locked above");
                let item_index = guard
                    .find(&id)
                    .ok_or_else(|| fail(format!("item {id} not found")))?;
                let json = guard.items[item_index].to_json(resource.id_field());
                if !step.r#as.is_empty() {
                    ctx.insert(step.r#as.clone(), json);
                }
            }
            StepKind::List => {
                let resource = resources
                    .get(step.resource.as_str())
                    .ok_or_else(|| fail(format!("resource {} not found", step.resource)))?;
                let guard = guards.get(resource.name()).expect("locked above");
                let listed = resource.list_locked(guard, &super::QueryFilter::default());
                if !step.r#as.is_empty() {
                    ctx.insert(step.r#as.clone(), Value::Array(listed.data));
                }
            }
            StepKind::Create => {
                let resource = resources
                    .get(step.resource.as_str())
                    .ok_or_else(|| fail(format!("resource {} not found", step.resource)))?;
                let mut data = serde_json::Map::new();
                for (field, expr) in &step.set {
                    data.insert(field.clone(), eval(expr, ctx).map_err(&fail)?);
                }
                let guard = guards.get_mut(resource.name()).expect("locked above");
                let item = resource
                    .create_locked(guard, data, &HashMap::new())
                    .map_err(|e| fail(e.to_string()))?;
                if !step.r#as.is_empty() {
                    ctx.insert(step.r#as.clone(), item.to_json(resource.id_field()));
                }
            }
            StepKind::Update => {
                let resource = resources
                    .get(step.resource.as_str())
                    .ok_or_else(|| fail(format!("resource {} not found", step.resource)))?;
                let id = eval_to_string(&step.id, ctx).map_err(&fail)?;
                let mut data = serde_json::Map::new();
                for (field, expr) in &step.set {
                    data.insert(field.clone(), eval(expr, ctx).map_err(&fail)?);
                }
                let guard = guards.get_mut(resource.name()).expect("locked above");
                let item = resource
                    .update_locked(guard, &id, data)
                    .map_err(|e| fail(e.to_string()))?;
                if !step.r#as.is_empty() {
                    ctx.insert(step.r#as.clone(), item.to_json(resource.id_field()));
                }
            }
            StepKind::Delete => {
                let resource = resources
                    .get(step.resource.as_str())
                    .ok_or_else(|| fail(format!("resource {} not found", step.resource)))?;
                let id = eval_to_string(&step.id, ctx).map_err(&fail)?;
                let guard = guards.get_mut(resource.name()).expect("locked above");
                resource
                    .delete_locked(guard, &id)
                    .map_err(|e| fail(e.to_string()))?;
            }
            StepKind::Set => {
                if step.var.is_empty() {
                    return Err(fail("set step requires var".to_string()));
                }
                let value = eval(&step.value, ctx).map_err(&fail)?;
                if step.require && !truthy(&value) {
                    return Err(fail(format!("condition {:?} not satisfied", step.value)));
                }
                ctx.insert(step.var.clone(), value);
            }
        }
    }
    Ok(())
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

// ============================================================================
// Expression evaluation
// ============================================================================

/// Evaluated expression value; alias kept public for handler glue.
pub type ExprValue = Value;

fn eval_to_string(expr: &str, ctx: &HashMap<String, Value>) -> Result<String, String> {
    let v = eval(expr, ctx)?;
    Ok(match v {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Evaluate an expression against the context.
pub(super) fn eval(expr: &str, ctx: &HashMap<String, Value>) -> Result<Value, String> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        ctx,
    };
    let value = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(format!("unexpected trailing input in {expr:?}"));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(String),
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(
                    text.parse().map_err(|_| format!("bad number {text:?}"))?,
                ));
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c.to_string()));
                i += 1;
            }
            '>' | '<' | '=' | '!' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::Op(format!("{c}=")));
                    i += 2;
                } else {
                    tokens.push(Token::Op(c.to_string()));
                    i += 1;
                }
            }
            '&' | '|' => {
                if i + 1 < chars.len() && chars[i + 1] == c {
                    tokens.push(Token::Op(format!("{c}{c}")));
                    i += 2;
                } else {
                    return Err(format!("unexpected character {c:?}"));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    ctx: &'a HashMap<String, Value>,
}

impl Parser<'_> {
    fn peek_op(&self) -> Option<&str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(op.as_str()),
            _ => None,
        }
    }

    fn parse_or(&mut self) -> Result<Value, String> {
        let mut left = self.parse_and()?;
        while self.peek_op() == Some("||") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value, String> {
        let mut left = self.parse_cmp()?;
        while self.peek_op() == Some("&&") {
            self.pos += 1;
            let right = self.parse_cmp()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Value, String> {
        let left = self.parse_add()?;
        let Some(op) = self.peek_op() else {
            return Ok(left);
        };
        if !matches!(op, ">" | "<" | ">=" | "<=" | "==" | "!=") {
            return Ok(left);
        }
        let op = op.to_string();
        self.pos += 1;
        let right = self.parse_add()?;
        Ok(Value::Bool(compare(&left, &right, &op)?))
    }

    fn parse_add(&mut self) -> Result<Value, String> {
        let mut left = self.parse_mul()?;
        while matches!(self.peek_op(), Some("+") | Some("-")) {
            let op = self.peek_op().unwrap().to_string();
            self.pos += 1;
            let right = self.parse_mul()?;
            left = arith(&left, &right, &op)?;
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Value, String> {
        let mut left = self.parse_atom()?;
        while matches!(self.peek_op(), Some("*") | Some("/")) {
            let op = self.peek_op().unwrap().to_string();
            self.pos += 1;
            let right = self.parse_atom()?;
            left = arith(&left, &right, &op)?;
        }
        Ok(left)
    }

    fn parse_atom(&mut self) -> Result<Value, String> {
        match self.tokens.get(self.pos) {
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(serde_json::Number::from_f64(*n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
            Some(Token::Str(s)) => {
                self.pos += 1;
                Ok(Value::String(s.clone()))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                match name.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    "null" => Ok(Value::Null),
                    path => Ok(lookup(path, self.ctx)),
                }
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let value = self.parse_or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err("expected )".to_string()),
                }
            }
            Some(Token::Op(op)) if op == "-" => {
                self.pos += 1;
                let value = self.parse_atom()?;
                arith(&Value::Number(0.into()), &value, "-")
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

/// Resolve a dotted path (`source.balance`) against the context. Missing
/// paths evaluate to null rather than erroring; guards turn that into an
/// operation failure when it matters.
fn lookup(path: &str, ctx: &HashMap<String, Value>) -> Value {
    let mut parts = path.split('.');
    let Some(root) = parts.next() else {
        return Value::Null;
    };
    let Some(mut current) = ctx.get(root) else {
        return Value::Null;
    };
    for part in parts {
        match current {
            Value::Object(map) => match map.get(part) {
                Some(v) => current = v,
                None => return Value::Null,
            },
            Value::Array(arr) => match part.parse::<usize>().ok().and_then(|i| arr.get(i)) {
                Some(v) => current = v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

fn as_number(v: &Value) -> Result<f64, String> {
    match v {
        Value::Number(n) => n.as_f64().ok_or_else(|| "bad number".to_string()),
        Value::String(s) => s.parse().map_err(|_| format!("{s:?} is not a number")),
        Value::Null => Err("null is not a number".to_string()),
        other => Err(format!("{other} is not a number")),
    }
}

fn arith(left: &Value, right: &Value, op: &str) -> Result<Value, String> {
    if op == "+" {
        if let (Value::String(a), b) = (left, right) {
            let b = match b {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(Value::String(format!("{a}{b}")));
        }
    }
    let a = as_number(left)?;
    let b = as_number(right)?;
    let result = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => {
            if b == 0.0 {
                return Err("division by zero".to_string());
            }
            a / b
        }
        _ => return Err(format!("unknown operator {op}")),
    };
    Ok(serde_json::Number::from_f64(result)
        .map(Value::Number)
        .unwrap_or(Value::Null))
}

fn compare(left: &Value, right: &Value, op: &str) -> Result<bool, String> {
    match op {
        "==" => return Ok(values_eq(left, right)),
        "!=" => return Ok(!values_eq(left, right)),
        _ => {}
    }
    let a = as_number(left)?;
    let b = as_number(right)?;
    Ok(match op {
        ">" => a > b,
        "<" => a < b,
        ">=" => a >= b,
        "<=" => a <= b,
        _ => return Err(format!("unknown comparison {op}")),
    })
}

fn values_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stateful::{QueryFilter, ResourceConfig};
    use serde_json::json;

    fn store_with_accounts() -> StateStore {
        let store = StateStore::new();
        let config: ResourceConfig = serde_json::from_value(json!({
            "name": "accounts",
            "basePath": "/api/accounts",
            "seedData": [
                {"id": "acct-1", "balance": 100},
                {"id": "acct-2", "balance": 50}
            ]
        }))
        .unwrap();
        store.register(config).unwrap();
        store
    }

    fn transfer_op() -> CustomOperation {
        serde_json::from_value(json!({
            "name": "TransferFunds",
            "steps": [
                {"type": "read", "resource": "accounts", "id": "input.from", "as": "source"},
                {"type": "read", "resource": "accounts", "id": "input.to", "as": "target"},
                {"type": "set", "var": "sufficient",
                 "value": "source.balance >= input.amount", "require": true},
                {"type": "update", "resource": "accounts", "id": "input.from",
                 "set": {"balance": "source.balance - input.amount"}, "as": "source"},
                {"type": "update", "resource": "accounts", "id": "input.to",
                 "set": {"balance": "target.balance + input.amount"}, "as": "target"}
            ],
            "response": {
                "fromBalance": "source.balance",
                "toBalance": "target.balance"
            }
        }))
        .unwrap()
    }

    #[test]
    fn expressions_evaluate() {
        let mut ctx = HashMap::new();
        ctx.insert("input".to_string(), json!({"amount": 30, "name": "x"}));
        assert_eq!(eval("input.amount + 12", &ctx).unwrap(), json!(42.0));
        assert_eq!(eval("input.amount >= 30", &ctx).unwrap(), json!(true));
        assert_eq!(eval("input.amount > 30", &ctx).unwrap(), json!(false));
        assert_eq!(eval("'id-' + input.name", &ctx).unwrap(), json!("id-x"));
        assert_eq!(
            eval("(input.amount - 10) * 2", &ctx).unwrap(),
            json!(40.0)
        );
        assert_eq!(eval("input.missing", &ctx).unwrap(), Value::Null);
        assert!(eval("input.amount / 0", &ctx).is_err());
    }

    #[test]
    fn transfer_debits_and_credits_atomically() {
        let store = store_with_accounts();
        store.register_operation(transfer_op());

        let result = store
            .execute_operation(
                "TransferFunds",
                json!({"from": "acct-1", "to": "acct-2", "amount": 30}),
            )
            .unwrap();
        assert_eq!(result["fromBalance"], json!(70.0));
        assert_eq!(result["toBalance"], json!(80.0));

        let accounts = store.get("accounts").unwrap();
        assert_eq!(accounts.get("acct-1").unwrap().data["balance"], json!(70.0));
        assert_eq!(accounts.get("acct-2").unwrap().data["balance"], json!(80.0));
    }

    #[test]
    fn failed_guard_rolls_back_everything() {
        let store = store_with_accounts();
        store.register_operation(transfer_op());

        let err = store
            .execute_operation(
                "TransferFunds",
                json!({"from": "acct-1", "to": "acct-2", "amount": 1000}),
            )
            .unwrap_err();
        assert!(matches!(err, StatefulError::StepFailed { step: 2, .. }));

        // Balances untouched.
        let accounts = store.get("accounts").unwrap();
        assert_eq!(accounts.get("acct-1").unwrap().data["balance"], json!(100));
        assert_eq!(accounts.get("acct-2").unwrap().data["balance"], json!(50));
    }

    #[test]
    fn mid_pipeline_failure_restores_prior_writes() {
        let store = store_with_accounts();
        let op: CustomOperation = serde_json::from_value(json!({
            "name": "BadPipeline",
            "steps": [
                {"type": "update", "resource": "accounts", "id": "'acct-1'",
                 "set": {"balance": "0"}},
                {"type": "read", "resource": "accounts", "id": "'missing'", "as": "x"}
            ]
        }))
        .unwrap();
        store.register_operation(op);

        let err = store
            .execute_operation("BadPipeline", json!({}))
            .unwrap_err();
        assert!(matches!(err, StatefulError::StepFailed { step: 1, .. }));

        let accounts = store.get("accounts").unwrap();
        assert_eq!(accounts.get("acct-1").unwrap().data["balance"], json!(100));
    }

    #[test]
    fn create_step_binds_new_item() {
        let store = store_with_accounts();
        let op: CustomOperation = serde_json::from_value(json!({
            "name": "OpenAccount",
            "steps": [
                {"type": "create", "resource": "accounts",
                 "set": {"balance": "input.initial"}, "as": "account"}
            ],
            "response": {"id": "account.id", "balance": "account.balance"}
        }))
        .unwrap();
        store.register_operation(op);

        let result = store
            .execute_operation("OpenAccount", json!({"initial": 25}))
            .unwrap();
        assert_eq!(result["balance"], json!(25.0));
        assert!(result["id"].as_str().is_some());

        let accounts = store.get("accounts").unwrap();
        assert_eq!(accounts.list(&QueryFilter::default()).meta.total, 3);
    }
}
