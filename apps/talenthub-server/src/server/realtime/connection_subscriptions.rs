use tokio::sync::mpsc;
use uuid::Uuid;

use crate::server::core::Subscriptions;

pub(crate) fn insert_subscription(
    subscriptions: &mut Subscriptions,
    channel: &str,
    connection_id: Uuid,
    outbound_tx: mpsc::Sender<String>,
) {
    subscriptions
        .entry(channel.to_owned())
        .or_default()
        .insert(connection_id, outbound_tx);
}

/// Returns whether the connection was subscribed.
pub(crate) fn remove_subscription(
    subscriptions: &mut Subscriptions,
    channel: &str,
    connection_id: Uuid,
) -> bool {
    let Some(listeners) = subscriptions.get_mut(channel) else {
        return false;
    };
    let removed = listeners.remove(&connection_id).is_some();
    if listeners.is_empty() {
        subscriptions.remove(channel);
    }
    removed
}

pub(crate) fn remove_connection_from_subscriptions(
    subscriptions: &mut Subscriptions,
    connection_id: Uuid,
) {
    subscriptions.retain(|_, listeners| {
        listeners.remove(&connection_id);
        !listeners.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{insert_subscription, remove_connection_from_subscriptions, remove_subscription};
    use crate::server::core::Subscriptions;

    #[test]
    fn removing_a_connection_prunes_empty_channels_only() {
        let target = Uuid::new_v4();
        let keep = Uuid::new_v4();
        let (target_tx, _) = mpsc::channel::<String>(1);
        let (keep_tx, _) = mpsc::channel::<String>(1);
        let mut subscriptions: Subscriptions = HashMap::new();
        insert_subscription(&mut subscriptions, "private-conv-a", target, target_tx.clone());
        insert_subscription(&mut subscriptions, "private-conv-b", target, target_tx);
        insert_subscription(&mut subscriptions, "private-conv-b", keep, keep_tx);

        remove_connection_from_subscriptions(&mut subscriptions, target);

        assert!(!subscriptions.contains_key("private-conv-a"));
        let remaining = subscriptions
            .get("private-conv-b")
            .expect("shared channel should remain");
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key(&keep));
    }

    #[test]
    fn unsubscribe_reports_whether_anything_changed() {
        let connection_id = Uuid::new_v4();
        let (tx, _) = mpsc::channel::<String>(1);
        let mut subscriptions: Subscriptions = HashMap::new();
        insert_subscription(&mut subscriptions, "private-conv-a", connection_id, tx);

        assert!(remove_subscription(&mut subscriptions, "private-conv-a", connection_id));
        assert!(!remove_subscription(&mut subscriptions, "private-conv-a", connection_id));
        assert!(subscriptions.is_empty());
    }
}
