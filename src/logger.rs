use anyhow::{Result, anyhow};
use ftail::Ftail;
use log::LevelFilter;
use std::env;
use std::fs;

const LOGS_DIR: &str = ".logs";
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Console gets warnings only; the file under `~/.logs/newsdigest/` gets the
/// full stream. `LOG_LEVEL` overrides the file level.
pub fn init_logger() -> Result<()> {
    let home_folder = match env::home_dir() {
        Some(h) => h,
        None => return Err(anyhow!("Could not determine $HOME")),
    };

    let logs_path = home_folder.join(LOGS_DIR).join(PKG_NAME);
    let logs_file = logs_path.join(format!("{PKG_NAME}.log"));

    fs::create_dir_all(&logs_path)
        .map_err(|e| anyhow!("Could not create logs dir at {:#?}: {}", &logs_path, e))?;

    let file_level = match env::var("LOG_LEVEL").as_deref() {
        Ok("debug") => LevelFilter::Debug,
        Ok("warn") => LevelFilter::Warn,
        Ok("error") => LevelFilter::Error,
        _ => LevelFilter::Info,
    };

    Ftail::new()
        .console(LevelFilter::Warn)
        .single_file(&logs_file, true, file_level)
        .init()
        .map_err(|e| anyhow!("Could not initialize logger: {}", e))?;

    Ok(())
}
