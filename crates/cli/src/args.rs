use clap::Parser;
use std::path::PathBuf;

/// Command line arguments for the proxy.
#[derive(Parser, Debug)]
#[clap(
    name = "clip",
    about = "Response-shaping proxy for Model Context Protocol servers",
    version
)]
pub struct CliArgs {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long = "config", default_value = "clip.json")]
    pub config: PathBuf,

    /// Write an example configuration file to the config path and exit.
    #[arg(long)]
    pub init: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_clip_json() {
        let args = CliArgs::parse_from(["clip"]);
        assert_eq!(args.config, PathBuf::from("clip.json"));
        assert!(!args.init);
    }

    #[test]
    fn accepts_config_path_and_init() {
        let args = CliArgs::parse_from(["clip", "-c", "/etc/clip.json", "--init"]);
        assert_eq!(args.config, PathBuf::from("/etc/clip.json"));
        assert!(args.init);
    }
}
