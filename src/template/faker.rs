//! Faker catalog for template placeholders.
//!
//! Every generator takes the shared thread rng; values are plausible but
//! never derived from real data. The catalog is reached through
//! [`faker_value`], keyed by the `faker.*` placeholder name.

use rand::Rng;

// =============================================================================
// Data tables
// =============================================================================

const FIRST_NAMES: &[&str] = &[
    "James", "Mary", "Robert", "Patricia", "John", "Jennifer", "Michael", "Linda", "David",
    "Elizabeth", "William", "Barbara", "Richard", "Susan", "Joseph", "Jessica", "Thomas", "Sarah",
    "Carlos", "Maria", "Wei", "Yuki", "Amara", "Olga", "Pierre", "Ingrid", "Raj", "Fatima",
];

const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Rodriguez",
    "Martinez", "Anderson", "Taylor", "Thomas", "Moore", "Jackson", "Martin", "Lee", "Thompson",
    "Nakamura", "Kowalski", "Novak", "Silva", "Kumar", "Chen", "Andersson", "Rossi",
];

const EMAIL_DOMAINS: &[&str] = &[
    "example.com", "example.org", "example.net", "mail.test", "inbox.test",
];

const CITIES: &[&str] = &[
    "Springfield", "Riverton", "Fairview", "Kingsport", "Lakewood", "Ashford", "Brookhaven",
    "Cedarville", "Dunmore", "Eastport", "Foxborough", "Glenwood", "Harborview", "Ironwood",
];

const STREETS: &[&str] = &[
    "Maple Street", "Oak Avenue", "Cedar Lane", "Elm Drive", "Pine Road", "Birch Boulevard",
    "Willow Way", "Chestnut Court", "Sycamore Place", "Juniper Terrace",
];

const COUNTRIES: &[&str] = &[
    "United States", "Germany", "Japan", "Brazil", "Canada", "France", "Australia", "India",
    "Sweden", "South Korea", "Netherlands", "Spain", "Italy", "Poland",
];

const COMPANIES: &[&str] = &[
    "Acme Corp", "Globex", "Initech", "Umbrella Labs", "Stark Industries", "Wayne Enterprises",
    "Wonka Industries", "Tyrell Corp", "Cyberdyne Systems", "Aperture Science",
];

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
];

const CURRENCY_CODES: &[&str] = &[
    "USD", "EUR", "GBP", "JPY", "AUD", "CAD", "CHF", "CNY", "SEK", "NZD", "MXN", "SGD", "HKD",
    "NOK", "KRW", "TRY", "INR", "BRL", "ZAR",
];

const COLORS: &[&str] = &[
    "Crimson", "Azure", "Emerald", "Ivory", "Coral", "Indigo", "Amber", "Jade", "Scarlet",
    "Turquoise", "Lavender", "Maroon", "Teal", "Orchid", "Cyan", "Magenta", "Gold", "Silver",
];

const PRODUCT_ADJECTIVES: &[&str] = &[
    "Rustic", "Elegant", "Handcrafted", "Refined", "Sleek", "Gorgeous", "Practical", "Modern",
    "Vintage", "Premium", "Compact", "Ergonomic", "Lightweight", "Durable",
];

const PRODUCT_MATERIALS: &[&str] = &[
    "Steel", "Wooden", "Granite", "Rubber", "Cotton", "Silk", "Leather", "Bamboo", "Bronze",
    "Copper", "Ceramic", "Glass", "Marble", "Titanium",
];

const PRODUCT_NOUNS: &[&str] = &[
    "Chair", "Table", "Lamp", "Keyboard", "Mouse", "Backpack", "Watch", "Wallet", "Headphones",
    "Speaker", "Notebook", "Pen", "Mug", "Bottle",
];

const JOB_LEVELS: &[&str] = &["Senior", "Junior", "Lead", "Principal", "Staff"];

const JOB_FIELDS: &[&str] = &[
    "Software", "Data", "Product", "Marketing", "Sales", "Operations", "Security",
    "Infrastructure", "Quality", "Research",
];

const JOB_ROLES: &[&str] = &[
    "Engineer", "Analyst", "Manager", "Designer", "Architect", "Consultant", "Developer",
    "Specialist", "Coordinator", "Strategist",
];

const MIME_TYPES: &[&str] = &[
    "application/json", "application/xml", "application/pdf", "application/zip",
    "application/octet-stream", "text/html", "text/plain", "text/csv", "image/png", "image/jpeg",
    "image/svg+xml", "audio/mpeg", "video/mp4", "multipart/form-data",
];

const FILE_EXTENSIONS: &[&str] = &[
    "pdf", "jpg", "png", "gif", "doc", "xlsx", "csv", "txt", "html", "js", "json", "xml", "zip",
    "tar", "gz", "mp3", "mp4", "svg", "md", "yaml", "log",
];

const WORDS: &[&str] = &[
    "ocean", "river", "mountain", "forest", "desert", "valley", "island", "canyon", "cloud",
    "storm", "thunder", "breeze", "shadow", "light", "flame", "frost", "crystal", "silver",
    "golden", "iron", "stone", "marble", "pearl", "amber", "falcon", "eagle", "wolf", "tiger",
    "horizon", "summit", "harbor", "bridge", "tower", "garden", "dream", "vision", "spirit",
    "echo", "pulse", "spark", "brave", "swift", "calm", "bold", "keen", "vast", "deep", "pure",
];

// =============================================================================
// Generators
// =============================================================================

fn pick<'a>(rng: &mut impl Rng, list: &'a [&'a str]) -> &'a str {
    list[rng.gen_range(0..list.len())]
}

fn first_name(rng: &mut impl Rng) -> String {
    pick(rng, FIRST_NAMES).to_string()
}

fn last_name(rng: &mut impl Rng) -> String {
    pick(rng, LAST_NAMES).to_string()
}

fn full_name(rng: &mut impl Rng) -> String {
    format!("{} {}", pick(rng, FIRST_NAMES), pick(rng, LAST_NAMES))
}

fn email(rng: &mut impl Rng) -> String {
    format!(
        "{}.{}@{}",
        pick(rng, FIRST_NAMES).to_lowercase(),
        pick(rng, LAST_NAMES).to_lowercase(),
        pick(rng, EMAIL_DOMAINS)
    )
}

fn username(rng: &mut impl Rng) -> String {
    format!(
        "{}{}",
        pick(rng, FIRST_NAMES).to_lowercase(),
        rng.gen_range(1..1000)
    )
}

fn phone(rng: &mut impl Rng) -> String {
    format!(
        "+1-{:03}-{:03}-{:04}",
        rng.gen_range(200..999),
        rng.gen_range(200..999),
        rng.gen_range(0..10000)
    )
}

fn ipv4(rng: &mut impl Rng) -> String {
    format!(
        "{}.{}.{}.{}",
        rng.gen_range(0..256),
        rng.gen_range(0..256),
        rng.gen_range(0..256),
        rng.gen_range(0..256)
    )
}

fn ipv6(rng: &mut impl Rng) -> String {
    (0..8)
        .map(|_| format!("{:04x}", rng.gen_range(0..65536)))
        .collect::<Vec<_>>()
        .join(":")
}

fn mac_address(rng: &mut impl Rng) -> String {
    (0..6)
        .map(|_| format!("{:02X}", rng.gen_range(0..256)))
        .collect::<Vec<_>>()
        .join(":")
}

fn url(rng: &mut impl Rng) -> String {
    format!(
        "https://{}.{}/{}",
        pick(rng, WORDS),
        pick(rng, EMAIL_DOMAINS),
        pick(rng, WORDS)
    )
}

/// Luhn-valid 16-digit card number with a Visa-like prefix.
fn credit_card(rng: &mut impl Rng) -> String {
    let mut digits = [0u32; 16];
    digits[0] = 4;
    for d in digits.iter_mut().take(15).skip(1) {
        *d = rng.gen_range(0..10);
    }

    // Check digit: double every digit at even index (odd position from the
    // right in a 16-digit number), subtract 9 when above 9.
    let mut sum = 0;
    for (i, d) in digits.iter().enumerate().take(15) {
        let mut v = *d;
        if i % 2 == 0 {
            v *= 2;
            if v > 9 {
                v -= 9;
            }
        }
        sum += v;
    }
    digits[15] = (10 - (sum % 10)) % 10;

    digits.iter().map(|d| d.to_string()).collect()
}

fn credit_card_exp(rng: &mut impl Rng) -> String {
    let month = rng.gen_range(1..13);
    let year = (chrono::Utc::now().format("%y").to_string().parse::<u32>()).unwrap_or(26)
        + rng.gen_range(1..6);
    format!("{month:02}/{:02}", year % 100)
}

fn cvv(rng: &mut impl Rng) -> String {
    format!("{:03}", rng.gen_range(0..1000))
}

fn iban(rng: &mut impl Rng) -> String {
    const PREFIXES: &[(&str, usize, &str)] = &[
        ("GB", 22, "WEST"),
        ("DE", 22, "DEUT"),
        ("FR", 27, "BNPA"),
        ("ES", 24, "BBVA"),
        ("NL", 18, "ABNA"),
    ];
    let (country, length, bank) = PREFIXES[rng.gen_range(0..PREFIXES.len())];
    let mut out = format!("{country}{:02}{bank}", rng.gen_range(10..100));
    while out.len() < length {
        out.push(char::from(b'0' + rng.gen_range(0..10) as u8));
    }
    out
}

fn price(rng: &mut impl Rng) -> String {
    format!("{}.{:02}", rng.gen_range(1..1000), rng.gen_range(0..100))
}

fn hex_color(rng: &mut impl Rng) -> String {
    format!(
        "#{:02X}{:02X}{:02X}",
        rng.gen_range(0..256),
        rng.gen_range(0..256),
        rng.gen_range(0..256)
    )
}

fn latitude(rng: &mut impl Rng) -> String {
    format!("{:.6}", rng.gen_range(-90.0..90.0))
}

fn longitude(rng: &mut impl Rng) -> String {
    format!("{:.6}", rng.gen_range(-180.0..180.0))
}

fn zip_code(rng: &mut impl Rng) -> String {
    format!("{:05}", rng.gen_range(0..100000))
}

fn street_address(rng: &mut impl Rng) -> String {
    format!("{} {}", rng.gen_range(1..9999), pick(rng, STREETS))
}

fn words(rng: &mut impl Rng, n: usize) -> String {
    (0..n.max(1))
        .map(|_| pick(rng, WORDS))
        .collect::<Vec<_>>()
        .join(" ")
}

fn slug(rng: &mut impl Rng) -> String {
    (0..3).map(|_| pick(rng, WORDS)).collect::<Vec<_>>().join("-")
}

fn sentence(rng: &mut impl Rng) -> String {
    let word_count = rng.gen_range(6..12);
    let raw = words(rng, word_count);
    let mut chars = raw.chars();
    let mut s = match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => raw,
    };
    s.push('.');
    s
}

fn product(rng: &mut impl Rng) -> String {
    format!(
        "{} {} {}",
        pick(rng, PRODUCT_ADJECTIVES),
        pick(rng, PRODUCT_MATERIALS),
        pick(rng, PRODUCT_NOUNS)
    )
}

fn job_title(rng: &mut impl Rng) -> String {
    format!(
        "{} {} {}",
        pick(rng, JOB_LEVELS),
        pick(rng, JOB_FIELDS),
        pick(rng, JOB_ROLES)
    )
}

fn ssn(rng: &mut impl Rng) -> String {
    format!(
        "{:03}-{:02}-{:04}",
        rng.gen_range(100..1000),
        rng.gen_range(1..100),
        rng.gen_range(1..10000)
    )
}

fn passport(rng: &mut impl Rng) -> String {
    let mut out = String::new();
    out.push(char::from(b'A' + rng.gen_range(0..26) as u8));
    out.push(char::from(b'A' + rng.gen_range(0..26) as u8));
    for _ in 0..7 {
        out.push(char::from(b'0' + rng.gen_range(0..10) as u8));
    }
    out
}

/// Resolve a `faker.<name>` placeholder. Unknown names yield `None` and the
/// engine substitutes an empty string.
pub fn faker_value(name: &str) -> Option<String> {
    let mut rng = rand::thread_rng();
    let value = match name {
        "firstName" => first_name(&mut rng),
        "lastName" => last_name(&mut rng),
        "name" | "fullName" => full_name(&mut rng),
        "email" => email(&mut rng),
        "username" => username(&mut rng),
        "phone" => phone(&mut rng),
        "ipv4" => ipv4(&mut rng),
        "ipv6" => ipv6(&mut rng),
        "mac" => mac_address(&mut rng),
        "url" => url(&mut rng),
        "userAgent" => pick(&mut rng, USER_AGENTS).to_string(),
        "creditCard" => credit_card(&mut rng),
        "creditCardExp" => credit_card_exp(&mut rng),
        "cvv" => cvv(&mut rng),
        "iban" => iban(&mut rng),
        "price" => price(&mut rng),
        "currencyCode" => pick(&mut rng, CURRENCY_CODES).to_string(),
        "city" => pick(&mut rng, CITIES).to_string(),
        "street" => street_address(&mut rng),
        "country" => pick(&mut rng, COUNTRIES).to_string(),
        "zipCode" => zip_code(&mut rng),
        "latitude" => latitude(&mut rng),
        "longitude" => longitude(&mut rng),
        "company" => pick(&mut rng, COMPANIES).to_string(),
        "jobTitle" => job_title(&mut rng),
        "color" => pick(&mut rng, COLORS).to_string(),
        "hexColor" => hex_color(&mut rng),
        "product" => product(&mut rng),
        "mimeType" => pick(&mut rng, MIME_TYPES).to_string(),
        "fileExtension" => pick(&mut rng, FILE_EXTENSIONS).to_string(),
        "word" => pick(&mut rng, WORDS).to_string(),
        "words" => words(&mut rng, 3),
        "sentence" => sentence(&mut rng),
        "slug" => slug(&mut rng),
        "ssn" => ssn(&mut rng),
        "passport" => passport(&mut rng),
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_card_passes_luhn() {
        for _ in 0..50 {
            let card = faker_value("creditCard").unwrap();
            assert_eq!(card.len(), 16);
            assert!(card.starts_with('4'));

            let digits: Vec<u32> = card.chars().map(|c| c.to_digit(10).unwrap()).collect();
            let mut sum = 0;
            for (i, d) in digits.iter().enumerate() {
                let mut v = *d;
                // Double every second digit from the right.
                if (digits.len() - i) % 2 == 0 {
                    v *= 2;
                    if v > 9 {
                        v -= 9;
                    }
                }
                sum += v;
            }
            assert_eq!(sum % 10, 0, "card {card} failed Luhn");
        }
    }

    #[test]
    fn ipv4_has_valid_octets() {
        let ip = faker_value("ipv4").unwrap();
        let octets: Vec<&str> = ip.split('.').collect();
        assert_eq!(octets.len(), 4);
        for o in octets {
            assert!(o.parse::<u32>().unwrap() < 256);
        }
    }

    #[test]
    fn email_looks_like_an_email() {
        let email = faker_value("email").unwrap();
        assert!(email.contains('@'));
        assert!(email.contains('.'));
    }

    #[test]
    fn unknown_name_is_none() {
        assert!(faker_value("notAFaker").is_none());
    }

    #[test]
    fn catalog_covers_the_advertised_names() {
        for name in [
            "firstName", "lastName", "name", "email", "username", "phone", "ipv4", "ipv6",
            "mac", "url", "userAgent", "creditCard", "creditCardExp", "cvv", "iban", "price",
            "currencyCode", "city", "street", "country", "zipCode", "latitude", "longitude",
            "company", "jobTitle", "color", "hexColor", "product", "mimeType", "fileExtension",
            "word", "words", "sentence", "slug", "ssn", "passport",
        ] {
            assert!(faker_value(name).is_some(), "missing faker {name}");
        }
    }
}
