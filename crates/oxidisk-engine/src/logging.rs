use env_logger::Target;
use std::fs;
use std::io;

/// Initialize logging for the privileged helper. Prefers a stable log file;
/// if the file cannot be created (permissions, read-only volume) logs go to
/// stderr instead.
pub fn init() {
    let target = (|| -> io::Result<Target> {
        fs::create_dir_all("/Library/Logs/oxidisk")?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open("/Library/Logs/oxidisk/helper.log")?;
        Ok(Target::Pipe(Box::new(file)))
    })()
    .unwrap_or(Target::Stderr);

    env_logger::Builder::from_default_env()
        .target(target)
        .filter_level(log::LevelFilter::Info)
        .init();
}
