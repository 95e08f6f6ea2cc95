mod app;

use color_eyre::Result;
use app::{App, AppConfig};

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    App::new(AppConfig::default()).run()?;

    Ok(())
}
