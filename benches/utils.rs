use mantle::{Context, Value};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::json;

/// `n` reproducible profile documents.
pub fn generate_random_contexts(n: usize) -> Vec<serde_json::Value> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n).map(|_| random_profile(&mut rng)).collect()
}

fn random_profile(rng: &mut StdRng) -> serde_json::Value {
    let name = random_string(rng, 5, 10);
    let age = rng.random_range(18..80);
    let is_active = rng.random_bool(0.7);

    let items = (0..rng.random_range(3..10))
        .map(|_| {
            json!({
                "name": random_string(rng, 3, 8),
                "value": rng.random_range(10..1000),
                "special": rng.random_bool(0.3)
            })
        })
        .collect::<Vec<_>>();

    json!({
        "user": {
            "name": name,
            "age": age,
            "active": is_active
        },
        "items": items,
        "show_details": rng.random_bool(0.8),
        "has_access": rng.random_bool(0.6),
    })
}

/// Converts a JSON object into render data.
pub fn to_context(json: &serde_json::Value) -> Context {
    match json {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(name, value)| (name.clone(), to_value(value)))
            .collect(),
        _ => Context::new(),
    }
}

fn to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map_or_else(|| Value::Float(n.as_f64().unwrap_or_default()), Value::Int),
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(items) => Value::list(items.iter().map(to_value)),
        serde_json::Value::Object(map) => {
            Value::dict(map.iter().map(|(key, value)| (key.clone(), to_value(value))))
        }
    }
}

/// A random string of `min..=max` characters, sometimes containing markup
/// so the escaping filters have work to do.
fn random_string(rng: &mut StdRng, min: usize, max: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz<>&";
    let len = rng.random_range(min..=max);
    (0..len)
        .map(|_| char::from(CHARSET[rng.random_range(0..CHARSET.len())]))
        .collect()
}

/// Reports the size of the bench binary, which tracks code size of the engine.
pub fn print_binary_size() {
    let path = std::env::current_exe().unwrap();
    let bytes = std::fs::metadata(&path).unwrap().len();
    println!(
        "{}: {:.1} KiB ({bytes} bytes)",
        path.display(),
        bytes as f64 / 1024.0
    );
}
