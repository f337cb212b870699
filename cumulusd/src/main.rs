use cumulusd::daemon::{DaemonConfig, DaemonRuntime, reset_state};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Reset,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--reset" => mode = CliMode::Reset,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    match parse_cli_mode(std::env::args())? {
        CliMode::Reset => {
            let config = DaemonConfig::from_env()?;
            reset_state(&config)?;
            eprintln!("[cumulusd] state indexes removed; next start runs a fresh bootstrap");
            return Ok(());
        }
        CliMode::Help => {
            println!("Usage: cumulusd [--reset]");
            println!("  --reset   Remove both state indexes and re-bootstrap on the next start");
            return Ok(());
        }
        CliMode::Run => {}
    }
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["cumulusd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_reset() {
        let mode = parse_cli_mode(vec!["cumulusd".to_string(), "--reset".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Reset);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        let mode = parse_cli_mode(vec!["cumulusd".to_string(), "--help".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_arguments() {
        assert!(parse_cli_mode(vec!["cumulusd".to_string(), "--bogus".to_string()]).is_err());
    }
}
