//! Reconciliation of a relay list against a freshly built desired set.
//!
//! Kept records move between list generations by value, carrying their
//! worker handle, source slot and flag block with them; only genuinely
//! new or restart-worthy entries produce fresh records.

use crate::relay::{RelayConfig, RelayRecord};

/// Whether two descriptions of the same mount differ in a way that
/// requires restarting the worker.
///
/// `on_demand` and `enabled` are deliberately absent: both are
/// assimilated in place by [`update_relay_set`]. Credentials are also not
/// compared -- a credential-only change keeps the old worker until it
/// reconnects for another reason (warned about at config-swap time).
pub(crate) fn relay_has_changed(new: &RelayConfig, old: &RelayConfig) -> bool {
    new.upstream_mount != old.upstream_mount
        || new.upstream_host != old.upstream_host
        || new.upstream_port != old.upstream_port
        || new.send_icy_metadata != old.send_icy_metadata
}

/// Build the next generation of a relay list.
///
/// Entries of `desired` that match a record in `current` (same
/// `local_mount`, no restart-worthy difference) detach that record and
/// keep it; everything else enters as-is. Records left in `current`
/// afterwards are the ones to tear down.
pub(crate) fn update_relay_set(
    current: &mut Vec<RelayRecord>,
    desired: Vec<RelayRecord>,
) -> Vec<RelayRecord> {
    let mut kept = Vec::with_capacity(desired.len());
    for wanted in desired {
        let existing = current.iter().position(|record| {
            record.config.local_mount == wanted.config.local_mount
                && !relay_has_changed(&wanted.config, &record.config)
        });
        match existing {
            Some(index) => {
                let mut record = current.swap_remove(index);
                record.config.on_demand = wanted.config.on_demand;
                record.config.enabled = wanted.config.enabled;
                kept.push(record);
            }
            None => kept.push(wanted),
        }
    }
    kept
}

/// Swap `current` for the reconciled set, returning the records to tear
/// down.
pub(crate) fn update_relays(
    current: &mut Vec<RelayRecord>,
    desired: Vec<RelayRecord>,
) -> Vec<RelayRecord> {
    let kept = update_relay_set(current, desired);
    std::mem::replace(current, kept)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::relay::RelayOrigin;

    fn config(local_mount: &str) -> RelayConfig {
        RelayConfig {
            local_mount: local_mount.to_string(),
            upstream_host: "upstream.example.org".to_string(),
            upstream_port: 8000,
            upstream_mount: local_mount.to_string(),
            username: None,
            password: None,
            send_icy_metadata: true,
            on_demand: false,
            enabled: true,
        }
    }

    fn record(local_mount: &str) -> RelayRecord {
        RelayRecord::new(config(local_mount), RelayOrigin::Configured)
    }

    fn mounts(list: &[RelayRecord]) -> Vec<&str> {
        list.iter().map(RelayRecord::local_mount).collect()
    }

    #[test]
    fn identical_lists_are_a_noop() {
        let mut current = vec![record("/a"), record("/b")];
        let shared_a = current[0].shared.clone();

        let to_free = update_relays(&mut current, vec![record("/a"), record("/b")]);
        assert!(to_free.is_empty());
        assert_eq!(mounts(&current), ["/a", "/b"]);
        // record identity preserved, not re-created
        let kept_a = current
            .iter()
            .find(|r| r.local_mount() == "/a")
            .unwrap();
        assert!(Arc::ptr_eq(&kept_a.shared, &shared_a));
    }

    #[test]
    fn removed_relays_end_up_in_to_free() {
        let mut current = vec![record("/a"), record("/b")];
        let to_free = update_relays(&mut current, vec![record("/b")]);
        assert_eq!(mounts(&current), ["/b"]);
        assert_eq!(mounts(&to_free), ["/a"]);
    }

    #[test]
    fn upstream_change_replaces_the_record() {
        let mut current = vec![record("/a")];
        let old_shared = current[0].shared.clone();

        let mut changed = record("/a");
        changed.config.upstream_port = 8100;
        let to_free = update_relays(&mut current, vec![changed]);

        assert_eq!(mounts(&to_free), ["/a"]);
        assert_eq!(mounts(&current), ["/a"]);
        assert!(!Arc::ptr_eq(&current[0].shared, &old_shared));
        assert_eq!(current[0].config.upstream_port, 8100);
    }

    #[test]
    fn each_restart_field_is_detected() {
        let base = config("/a");
        for mutate in [
            (|c: &mut RelayConfig| c.upstream_mount = "/other".to_string())
                as fn(&mut RelayConfig),
            |c| c.upstream_host = "other.example.org".to_string(),
            |c| c.upstream_port = 9000,
            |c| c.send_icy_metadata = false,
        ] {
            let mut changed = base.clone();
            mutate(&mut changed);
            assert!(relay_has_changed(&changed, &base));
        }
    }

    #[test]
    fn on_demand_and_enabled_are_assimilated() {
        let mut current = vec![record("/a")];
        let shared = current[0].shared.clone();

        let mut wanted = record("/a");
        wanted.config.on_demand = true;
        wanted.config.enabled = false;
        let to_free = update_relays(&mut current, vec![wanted]);

        assert!(to_free.is_empty());
        assert!(Arc::ptr_eq(&current[0].shared, &shared));
        assert!(current[0].config.on_demand);
        assert!(!current[0].config.enabled);
    }

    #[test]
    fn credential_change_alone_keeps_the_record() {
        let mut current = vec![record("/a")];
        let shared = current[0].shared.clone();

        let mut wanted = record("/a");
        wanted.config.username = Some("user".to_string());
        wanted.config.password = Some("secret".to_string());
        let to_free = update_relays(&mut current, vec![wanted]);

        assert!(to_free.is_empty());
        assert!(Arc::ptr_eq(&current[0].shared, &shared));
        // the kept record still carries the old credentials
        assert!(current[0].config.username.is_none());
    }
}
