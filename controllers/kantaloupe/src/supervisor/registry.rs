//! Member controllers known to the supervisor and the enable list grammar.

use std::fmt;

/// A controller run against every Ready member cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberControllerKind {
    Flow,
    FlowDeployment,
    RestartDevicePlugin,
    CleanupInactiveWorkload,
    PodGpuMemScale,
    GatewaySection,
}

impl MemberControllerKind {
    /// Every member controller, in start order.
    pub const ALL: [MemberControllerKind; 6] = [
        MemberControllerKind::Flow,
        MemberControllerKind::FlowDeployment,
        MemberControllerKind::RestartDevicePlugin,
        MemberControllerKind::CleanupInactiveWorkload,
        MemberControllerKind::PodGpuMemScale,
        MemberControllerKind::GatewaySection,
    ];

    /// Name used in `MULTI_CONTROLLERS`.
    pub fn name(self) -> &'static str {
        match self {
            MemberControllerKind::Flow => "kantaloupeflowController",
            MemberControllerKind::FlowDeployment => "kantaloupeflowDeploymentController",
            MemberControllerKind::RestartDevicePlugin => "restartDevicePluginController",
            MemberControllerKind::CleanupInactiveWorkload => "cleanupInactiveWorkloadController",
            MemberControllerKind::PodGpuMemScale => "podGPUMemScaleController",
            MemberControllerKind::GatewaySection => "gatewaysectionControllerController",
        }
    }

    /// Kinds switched on by `controllers`.
    pub fn enabled(controllers: &[String]) -> Vec<MemberControllerKind> {
        Self::ALL.into_iter().filter(|k| is_enabled(controllers, k.name())).collect()
    }
}

impl fmt::Display for MemberControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `name` is switched on by the enable list.
///
/// `name` enables and `-name` disables; the first match wins. `*` enables
/// every controller that is not explicitly disabled.
pub fn is_enabled(controllers: &[String], name: &str) -> bool {
    let mut has_star = false;
    for ctrl in controllers {
        if ctrl == name {
            return true;
        }
        if ctrl.strip_prefix('-') == Some(name) {
            return false;
        }
        if ctrl == "*" {
            has_star = true;
        }
    }
    has_star
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MULTI_CONTROLLERS;

    fn list(s: &str) -> Vec<String> {
        s.split(',').map(str::to_string).collect()
    }

    #[test]
    fn test_default_disables_cleanup_only() {
        let enabled = MemberControllerKind::enabled(&list(DEFAULT_MULTI_CONTROLLERS));
        assert_eq!(enabled.len(), 5);
        assert!(!enabled.contains(&MemberControllerKind::CleanupInactiveWorkload));
    }

    #[test]
    fn test_first_match_wins() {
        assert!(is_enabled(&list("podGPUMemScaleController,-podGPUMemScaleController"), "podGPUMemScaleController"));
        assert!(!is_enabled(&list("-podGPUMemScaleController,podGPUMemScaleController,*"), "podGPUMemScaleController"));
    }

    #[test]
    fn test_without_star_only_named_controllers_run() {
        let controllers = list("kantaloupeflowController");
        assert_eq!(MemberControllerKind::enabled(&controllers), vec![MemberControllerKind::Flow]);
        assert!(!is_enabled(&[], "kantaloupeflowController"));
    }
}
