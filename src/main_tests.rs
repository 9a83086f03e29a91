// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `main.rs` - command line parsing and signal handling

#[cfg(test)]
mod tests {
    use super::super::*;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    fn standalone(args: &[&str]) -> StandaloneArgs {
        let argv = ["gateport", "standalone", "--namespace", "istio-system"]
            .into_iter()
            .chain(args.iter().copied());
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Standalone(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_standalone_defaults() {
        let args = standalone(&[]);
        let config = standalone_config(&args);

        assert_eq!(config.sync.namespace, "istio-system");
        assert_eq!(config.sync.default_ports, vec![80, 443, 15021]);
        assert_eq!(config.sync.ignore_key, DEFAULT_IGNORE_KEY);
        assert!(config.manager.leader_election);
        assert_eq!(config.manager.lease_duration_secs, 15);
        assert_eq!(config.manager.renew_deadline_secs, 10);
        assert_eq!(config.manager.retry_period_secs, 5);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_standalone_flags() {
        let args = standalone(&[
            "--service-name",
            "edge-gateway",
            "--default-ports",
            "80,8443",
            "--ignore-key",
            "example.com/skip",
            "--in-cluster",
            "--context",
            "staging",
            "--no-leader-election",
            "--no-metrics",
        ]);
        let config = standalone_config(&args);

        assert_eq!(config.sync.service_name, "edge-gateway");
        assert_eq!(config.sync.default_ports, vec![80, 8443]);
        assert_eq!(config.sync.ignore_key, "example.com/skip");
        assert!(config.kubernetes.in_cluster);
        assert_eq!(config.kubernetes.context.as_deref(), Some("staging"));
        assert!(!config.manager.leader_election);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_standalone_rejects_non_numeric_ports() {
        let result = Cli::try_parse_from([
            "gateport",
            "standalone",
            "--default-ports",
            "80,https",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_manager_config_path() {
        let cli =
            Cli::try_parse_from(["gateport", "manager", "--config", "/tmp/gateport.yaml"]).unwrap();
        match cli.command {
            Command::Manager(args) => assert_eq!(args.config, PathBuf::from("/tmp/gateport.yaml")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_version_and_completions_parse() {
        let cli = Cli::try_parse_from(["gateport", "version", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Version { json: true }));

        let cli = Cli::try_parse_from(["gateport", "completions", "bash"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Completions { shell: Shell::Bash }
        ));
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["gateport"]).is_err());
    }

    /// Test that the SIGTERM handler can be created
    #[tokio::test]
    async fn test_sigterm_signal_handler_creation() {
        use tokio::signal::unix::{signal, SignalKind};

        let result = signal(SignalKind::terminate());
        assert!(
            result.is_ok(),
            "Should be able to create SIGTERM signal handler"
        );
    }

    /// No signal arrives, so waiting for one times out
    #[tokio::test]
    async fn test_shutdown_signal_waits_for_a_signal() {
        let result = timeout(StdDuration::from_millis(100), shutdown_signal()).await;
        assert!(result.is_err(), "shutdown_signal should not complete on its own");
    }
}
