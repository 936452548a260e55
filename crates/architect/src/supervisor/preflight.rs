//! Preflight probes run before a fresh run is allowed to start.
//!
//! Checks that the configured backend binaries and gate command executables
//! can actually be found. Missing required executables are fatal; a missing
//! primary with a healthy fallback, or an identical primary/fallback pair,
//! only warns.

use std::path::Path;

use crate::config::ArchitectConfig;
use crate::contracts::{now_iso, PreflightReport};

/// Whether the executable behind `command` resolves on `PATH` (or exists
/// directly when given as a path).
pub fn command_available(command: &str) -> bool {
    let Some(parts) = shlex::split(command) else {
        return false;
    };
    let Some(program) = parts.first() else {
        return false;
    };
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(program).is_file())
}

pub fn run_preflight(config: &ArchitectConfig) -> PreflightReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let primary = config.backend.primary.trim();
    let fallback = config.backend.fallback.trim();
    let primary_ok = command_available(primary);
    let fallback_ok = command_available(fallback);

    if primary == fallback {
        warnings.push(format!(
            "primary and fallback backends are both '{primary}'; failover is disabled"
        ));
        if !primary_ok {
            errors.push(format!("backend binary '{primary}' not found"));
        }
    } else if !primary_ok && !fallback_ok {
        errors.push(format!(
            "neither backend binary is available: '{primary}', '{fallback}'"
        ));
    } else if !primary_ok {
        warnings.push(format!(
            "primary backend binary '{primary}' not found; relying on fallback '{fallback}'"
        ));
    } else if !fallback_ok {
        warnings.push(format!(
            "fallback backend binary '{fallback}' not found; failover unavailable"
        ));
    }

    let mut require = |label: &str, command: &str, enabled: bool| {
        if !enabled || command.trim().is_empty() {
            return;
        }
        if !command_available(command) {
            errors.push(format!(
                "{label} command executable not found: '{command}'"
            ));
        }
    };
    require("lint", &config.project.lint_command, config.workflow.auto_lint);
    require("type-check", &config.project.type_check_command, true);
    require("test", &config.project.test_command, config.workflow.auto_test);

    PreflightReport {
        checked_at: now_iso(),
        ok: errors.is_empty(),
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_binaries_resolve() {
        assert!(command_available("sh -c 'echo hi'"));
        assert!(command_available("echo hello"));
        assert!(!command_available("definitely-not-a-real-binary-xyz"));
        assert!(!command_available(""));
    }

    #[test]
    fn missing_gate_commands_are_fatal() {
        let mut config = ArchitectConfig::default();
        config.backend.primary = "sh".into();
        config.backend.fallback = "echo".into();
        config.project.lint_command = "definitely-not-a-real-binary-xyz check".into();
        config.project.type_check_command = String::new();
        config.project.test_command = "echo test".into();
        let report = run_preflight(&config);
        assert!(!report.ok);
        assert!(report.errors[0].contains("lint"));
    }

    #[test]
    fn identical_backends_warn_but_pass() {
        let mut config = ArchitectConfig::default();
        config.backend.primary = "sh".into();
        config.backend.fallback = "sh".into();
        config.project.lint_command = "echo lint".into();
        config.project.type_check_command = String::new();
        config.project.test_command = "echo test".into();
        let report = run_preflight(&config);
        assert!(report.ok);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("failover is disabled")));
    }

    #[test]
    fn both_backends_missing_is_fatal() {
        let mut config = ArchitectConfig::default();
        config.backend.primary = "definitely-not-a-real-binary-abc".into();
        config.backend.fallback = "definitely-not-a-real-binary-xyz".into();
        config.project.lint_command = "echo lint".into();
        config.project.type_check_command = String::new();
        config.project.test_command = "echo test".into();
        let report = run_preflight(&config);
        assert!(!report.ok);
        assert!(report.errors[0].contains("neither backend binary"));
    }

    #[test]
    fn disabled_gates_are_not_probed() {
        let mut config = ArchitectConfig::default();
        config.backend.primary = "sh".into();
        config.backend.fallback = "echo".into();
        config.workflow.auto_lint = false;
        config.workflow.auto_test = false;
        config.project.lint_command = "definitely-not-a-real-binary-xyz".into();
        config.project.test_command = "definitely-not-a-real-binary-xyz".into();
        config.project.type_check_command = String::new();
        let report = run_preflight(&config);
        assert!(report.ok);
    }
}
