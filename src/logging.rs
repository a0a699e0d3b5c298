//! Logging setup for the GPU switching daemon

use fern::Dispatch;
use log::LevelFilter;
use std::path::Path;

/// Map a `-v` count onto a level, never going below `floor`
pub fn level_for(verbosity: u8, floor: LevelFilter) -> LevelFilter {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    level.max(floor)
}

/// Setup logging to stdout, and additionally to `log_file` when given
pub fn setup(level: LevelFilter, log_file: Option<&Path>) -> Result<(), fern::InitError> {
    let mut dispatch = Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // zbus is chatty at debug level and drowns out the switch sequence
        .level_for("zbus", level.min(LevelFilter::Info))
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(level_for(0, LevelFilter::Off), LevelFilter::Warn);
        assert_eq!(level_for(2, LevelFilter::Off), LevelFilter::Debug);
        assert_eq!(level_for(9, LevelFilter::Off), LevelFilter::Trace);
        // daemon floor keeps Info even without -v
        assert_eq!(level_for(0, LevelFilter::Info), LevelFilter::Info);
        assert_eq!(level_for(3, LevelFilter::Info), LevelFilter::Trace);
    }
}
