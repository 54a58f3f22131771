use std::collections::HashMap;

use crate::{
    message::BroadcastMessage,
    outbound::{DeliveryError, Outbound},
    session::SessionId,
};

/// A recipient that could not take a fanned-out message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub id: SessionId,
    pub error: DeliveryError,
}

/// The set of active sessions and their outbound handles.
///
/// Owned by the broadcaster loop and never shared, so it needs no locking.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<SessionId, Outbound>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Registers `outbound` under `id` unless the id is already taken, in
    /// which case the rejected handle is handed back.
    pub fn insert(&mut self, id: SessionId, outbound: Outbound) -> Result<(), Outbound> {
        if self.sessions.contains_key(&id) {
            return Err(outbound);
        }
        self.sessions.insert(id, outbound);
        Ok(())
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<Outbound> {
        self.sessions.remove(id)
    }

    /// Removes every session, closing all outbound handles.
    pub fn clear(&mut self) {
        for (_, outbound) in self.sessions.drain() {
            outbound.close();
        }
    }

    /// Queues `message` for every registered session except `exclude`.
    ///
    /// Each recipient is tried independently; the ones that failed are
    /// returned for the caller to deal with.
    pub fn fan_out(
        &self,
        message: &BroadcastMessage,
        exclude: Option<&SessionId>,
    ) -> Vec<DeliveryFailure> {
        self.sessions
            .iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .filter_map(|(id, outbound)| {
                outbound
                    .deliver(message.clone())
                    .err()
                    .map(|error| DeliveryFailure {
                        id: id.clone(),
                        error,
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::outbound_channel;

    fn id(port: u16) -> SessionId {
        SessionId::new(u64::from(port), format!("127.0.0.1:{port}"))
    }

    #[test]
    fn fan_out_skips_excluded_session() {
        let mut registry = Registry::new();
        let (a_out, mut a_in) = outbound_channel(4);
        let (b_out, mut b_in) = outbound_channel(4);
        registry.insert(id(1), a_out).expect("insert a");
        registry.insert(id(2), b_out).expect("insert b");

        let failures = registry.fan_out(&BroadcastMessage::new("hi"), Some(&id(1)));

        assert!(failures.is_empty());
        assert_eq!(a_in.try_next(), None);
        assert_eq!(b_in.try_next(), Some(BroadcastMessage::new("hi")));
    }

    #[test]
    fn fan_out_reports_each_failed_recipient() {
        let mut registry = Registry::new();
        let (full_out, _full_in) = outbound_channel(1);
        let (gone_out, gone_in) = outbound_channel(1);
        let (ok_out, mut ok_in) = outbound_channel(4);
        full_out
            .deliver(BroadcastMessage::new("backlog"))
            .expect("fill queue");
        drop(gone_in);
        registry.insert(id(1), full_out).expect("insert full");
        registry.insert(id(2), gone_out).expect("insert gone");
        registry.insert(id(3), ok_out).expect("insert ok");

        let mut failures = registry.fan_out(&BroadcastMessage::new("hi"), None);
        failures.sort_by_key(|failure| failure.id.to_string());

        assert_eq!(
            failures,
            vec![
                DeliveryFailure {
                    id: id(1),
                    error: DeliveryError::Full
                },
                DeliveryFailure {
                    id: id(2),
                    error: DeliveryError::Closed
                },
            ]
        );
        assert_eq!(ok_in.try_next(), Some(BroadcastMessage::new("hi")));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut registry = Registry::new();
        let (first, _first_in) = outbound_channel(1);
        let (second, _second_in) = outbound_channel(1);
        registry.insert(id(1), first).expect("insert first");
        assert!(registry.insert(id(1), second).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_then_close_ends_inbox() {
        let mut registry = Registry::new();
        let (outbound, mut inbox) = outbound_channel(1);
        registry.insert(id(1), outbound).expect("insert");

        registry.remove(&id(1)).expect("registered").close();

        assert!(registry.is_empty());
        assert!(registry.remove(&id(1)).is_none());
        assert_eq!(inbox.next().await, None);
    }
}
