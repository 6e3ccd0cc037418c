/// Minutes assumed when two locations share a metro area (0.1 h).
pub const SAME_AREA_MINUTES: u64 = 6;
/// Minutes assumed for any pair the table does not know.
pub const DEFAULT_MINUTES: u64 = 60;

const KNOWN_PAIRS: &[(&str, &str, u64)] = &[
    ("santos", "sao paulo", 75),
    ("santos", "guarulhos", 120),
    ("santos", "gru", 120),
    ("santos", "varginha", 300),
    ("santos", "campinas", 150),
    ("sao paulo", "varginha", 240),
    ("sao paulo", "campinas", 90),
    ("sao paulo", "guarulhos", 45),
    ("sao paulo", "gru", 45),
    ("sao paulo", "rio de janeiro", 360),
    ("campinas", "varginha", 180),
    ("guarulhos", "varginha", 240),
    ("gru", "varginha", 240),
];

/// Lowercases, strips Latin accents and collapses whitespace.
pub fn normalize_token(value: &str) -> String {
    let folded = value
        .chars()
        .flat_map(char::to_lowercase)
        .map(fold_accent)
        .collect::<String>();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fold_accent(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}

fn same_metro_area(origin: &str, destination: &str) -> bool {
    !origin.is_empty()
        && !destination.is_empty()
        && (origin.contains(destination) || destination.contains(origin))
}

// Whole-word match so "gru" does not hit "grupo".
fn mentions(token: &str, city: &str) -> bool {
    let spaced = token
        .chars()
        .map(|ch| if ch.is_alphanumeric() { ch } else { ' ' })
        .collect::<String>();
    format!(" {} ", normalize_token(&spaced)).contains(&format!(" {city} "))
}

/// Offline travel estimate in minutes, used when the distance provider fails.
pub fn estimate_minutes(origin: &str, destination: &str) -> u64 {
    let origin = normalize_token(origin);
    let destination = normalize_token(destination);

    if same_metro_area(&origin, &destination) {
        return SAME_AREA_MINUTES;
    }

    KNOWN_PAIRS
        .iter()
        .find(|(left, right, _)| {
            (mentions(&origin, left) && mentions(&destination, right))
                || (mentions(&origin, right) && mentions(&destination, left))
        })
        .map(|(_, _, minutes)| *minutes)
        .unwrap_or(DEFAULT_MINUTES)
}

pub fn estimate_seconds(origin: &str, destination: &str) -> u64 {
    estimate_minutes(origin, destination) * 60
}
