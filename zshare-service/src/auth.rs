// SPDX-License-Identifier: GPL-3.0-only

//! Caller authorization for the D-Bus interface.
//!
//! Root and the configured trusted uids pass directly; everyone else is
//! checked against polkit.

use std::collections::{BTreeSet, HashMap};

use zbus::Connection;
use zbus::fdo;
use zbus::message::Header as MessageHeader;
use zbus::names::BusName;
use zbus_polkit::policykit1::{AuthorityProxy, CheckAuthorizationFlags, Subject};

/// Publishing events and forcing resyncs.
pub const ACTION_MODIFY: &str = "org.zshare.reconciler.modify";
/// Scanning the host for drift.
pub const ACTION_READ: &str = "org.zshare.reconciler.read";

/// Callers allowed without asking polkit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedCallers {
    uids: BTreeSet<u32>,
}

impl TrustedCallers {
    pub fn new(uids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            uids: uids.into_iter().collect(),
        }
    }

    /// Root is always trusted.
    pub fn contains(&self, uid: u32) -> bool {
        uid == 0 || self.uids.contains(&uid)
    }
}

/// Fail with `AccessDenied` unless the sender of `header` may perform `action_id`.
pub async fn require_authorization(
    connection: &Connection,
    header: &MessageHeader<'_>,
    trusted: &TrustedCallers,
    action_id: &str,
) -> fdo::Result<()> {
    let sender = header
        .sender()
        .ok_or_else(|| fdo::Error::AccessDenied("No sender in message header".to_string()))?
        .as_str()
        .to_string();

    let dbus_proxy = fdo::DBusProxy::new(connection)
        .await
        .map_err(|e| fdo::Error::Failed(format!("D-Bus connection error: {e}")))?;
    let bus_name: BusName = sender
        .as_str()
        .try_into()
        .map_err(|e| fdo::Error::Failed(format!("Invalid bus name: {e}")))?;

    let uid = dbus_proxy
        .get_connection_unix_user(bus_name.clone())
        .await
        .map_err(|e| fdo::Error::Failed(format!("Failed to get caller UID: {e}")))?;
    if trusted.contains(uid) {
        tracing::debug!("Caller {} (uid {}) is trusted for {}", sender, uid, action_id);
        return Ok(());
    }

    let pid = dbus_proxy
        .get_connection_unix_process_id(bus_name)
        .await
        .map_err(|e| fdo::Error::Failed(format!("Failed to get caller PID: {e}")))?;

    let authority = AuthorityProxy::new(connection)
        .await
        .map_err(|e| fdo::Error::Failed(format!("Polkit connection error: {e}")))?;
    let subject = Subject::new_for_owner(pid, None, None)
        .map_err(|e| fdo::Error::Failed(format!("Failed to create Polkit subject: {e}")))?;

    let result = authority
        .check_authorization(
            &subject,
            action_id,
            &HashMap::new(),
            CheckAuthorizationFlags::AllowUserInteraction.into(),
            "",
        )
        .await
        .map_err(|e| fdo::Error::Failed(format!("Authorization check failed: {e}")))?;

    tracing::debug!(
        "Authorization result for {} (uid {}, action {}): authorized={}, challenged={}",
        sender,
        uid,
        action_id,
        result.is_authorized,
        result.is_challenge
    );

    if !result.is_authorized {
        tracing::warn!("Denied {} to uid {}", action_id, uid);
        return Err(fdo::Error::AccessDenied(format!(
            "Not authorized for action: {action_id}"
        )));
    }
    Ok(())
}
