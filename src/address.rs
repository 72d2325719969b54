/// Addresses some stacks report instead of the real hardware address.
const PLACEHOLDERS: [&str; 2] = ["02-00-00-00-00-00", "00-00-00-00-00-00"];

/// Normalizes a hardware address into `XX-XX-XX-XX-XX-XX`.
///
/// Separators (`:` or `-`) and surrounding whitespace are dropped and the
/// digits uppercased. Input that does not come out as twelve characters is
/// returned in that cleaned form rather than rejected. Formatting is
/// idempotent.
pub fn canonical(address: &str) -> String {
    let clean: String = address
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .flat_map(char::to_uppercase)
        .collect();

    if clean.chars().count() != 12 {
        return clean;
    }

    let chars: Vec<char> = clean.chars().collect();
    chars
        .chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// True if the address is empty or a known placeholder once canonicalized.
pub fn is_placeholder(address: &str) -> bool {
    let address = canonical(address);
    address.is_empty() || PLACEHOLDERS.contains(&address.as_str())
}
