use std::collections::HashMap;

use tokio::sync::watch;
use uuid::Uuid;

use crate::server::core::ConnectionControl;

/// Tells each listed socket task to close. Unknown ids are ignored.
pub(crate) fn close_connections(
    controls: &HashMap<Uuid, watch::Sender<ConnectionControl>>,
    connection_ids: &[Uuid],
) {
    connection_ids
        .iter()
        .filter_map(|connection_id| controls.get(connection_id))
        .for_each(|control| {
            control.send_replace(ConnectionControl::Close);
        });
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::watch;
    use uuid::Uuid;

    use super::close_connections;
    use crate::server::core::ConnectionControl;

    #[test]
    fn only_listed_connections_are_closed() {
        let lagging = Uuid::new_v4();
        let healthy = Uuid::new_v4();
        let (lagging_tx, lagging_rx) = watch::channel(ConnectionControl::Open);
        let (healthy_tx, healthy_rx) = watch::channel(ConnectionControl::Open);
        let controls = HashMap::from([(lagging, lagging_tx), (healthy, healthy_tx)]);

        close_connections(&controls, &[lagging, Uuid::new_v4()]);

        assert_eq!(*lagging_rx.borrow(), ConnectionControl::Close);
        assert_eq!(*healthy_rx.borrow(), ConnectionControl::Open);
    }
}
