//! Local identity derivation.

use crate::peer::PeerId;

/// Build the identity this node advertises.
///
/// Uses the given display name, falling back to the system hostname and then
/// to a generated name. On simulation hosts several instances usually share
/// one machine name, so a short random suffix is appended.
pub fn local_peer_id(display_name: Option<&str>, simulated_host: bool) -> PeerId {
    let base = display_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(system_display_name)
        .unwrap_or_else(generated_display_name);

    if simulated_host {
        let suffix: u16 = rand::random();
        PeerId::new(format!("{} (sim-{:04x})", base, suffix))
    } else {
        PeerId::new(base)
    }
}

fn system_display_name() -> Option<String> {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().to_string())
        .filter(|h| !h.is_empty())
}

fn generated_display_name() -> String {
    names::Generator::default()
        .next()
        .unwrap_or_else(|| "nearcast-device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_name_used_verbatim() {
        let id = local_peer_id(Some("Kitchen iPad"), false);
        assert_eq!(id.as_str(), "Kitchen iPad");
    }

    #[test]
    fn test_blank_name_falls_back() {
        let id = local_peer_id(Some("   "), false);
        assert!(!id.as_str().trim().is_empty());
    }

    #[test]
    fn test_simulated_host_gets_suffix() {
        let id = local_peer_id(Some("Simulator"), true);
        assert!(id.as_str().starts_with("Simulator (sim-"));
        assert!(id.as_str().ends_with(')'));
    }
}
