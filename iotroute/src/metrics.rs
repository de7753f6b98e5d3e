//! Routing engine counters.
//!
//! Every counter is a lock-free `AtomicUsize` with a generated `<name>_inc`
//! and a `<name>` getter. [`Metrics::to_json`] renders the counters with
//! dotted names, e.g. `messages.routed`.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! metrics {
    ($($field:ident => $inc:ident),* $(,)?) => {
        #[derive(Serialize, Deserialize, Debug, Default)]
        pub struct Metrics {
            $($field: AtomicUsize,)*
        }

        impl Metrics {
            $(
                #[inline]
                pub fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::SeqCst);
                }

                #[inline]
                pub fn $field(&self) -> usize {
                    self.$field.load(Ordering::SeqCst)
                }
            )*

            pub fn to_json(&self) -> serde_json::Value {
                let mut map = serde_json::Map::new();
                $(map.insert(stringify!($field).replace('_', "."), self.$field.load(Ordering::SeqCst).into());)*
                serde_json::Value::Object(map)
            }
        }
    };
}

metrics! {
    messages_routed => messages_routed_inc,
    messages_dropped => messages_dropped_inc,
    routing_errors => routing_errors_inc,
    storage_enqueued => storage_enqueued_inc,
    live_data_enqueued => live_data_enqueued_inc,
    triggers_enqueued => triggers_enqueued_inc,
    actuator_enqueued => actuator_enqueued_inc,
    reloads => reloads_inc,
    reload_failures => reload_failures_inc,
    live_data_flushes => live_data_flushes_inc,
    ingress_accepted => ingress_accepted_inc,
    ingress_rejected => ingress_rejected_inc,
}

#[cfg(test)]
mod tests {
    use super::Metrics;

    #[test]
    fn counters() {
        let m = Metrics::default();
        m.messages_routed_inc();
        m.messages_routed_inc();
        m.routing_errors_inc();
        assert_eq!(m.messages_routed(), 2);
        assert_eq!(m.routing_errors(), 1);
        assert_eq!(m.reloads(), 0);

        let json = m.to_json();
        assert_eq!(json["messages.routed"], 2);
        assert_eq!(json["live.data.flushes"], 0);
    }
}
