use arena_vision::config::VisionSettings;
use serde_json::json;

fn main() -> Result<(), serde_json::Error> {
    let settings = VisionSettings::default();
    let json = json!(settings);
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
