use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    // Generate version information for use in `chunkcache --version`.
    shadow_rs::new()?;

    Ok(())
}
