use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use super::{AppType, Envelope, MessageKind};

/// Application message callback.
///
/// The source endpoint is `None` when the message arrived relayed through the server.
pub type Handler = Arc<dyn Fn(&Envelope<'_>, Option<SocketAddr>) + Send + Sync>;

/// Handlers for application (non-negative) message types.
///
/// Control messages never reach this table, engines match on [`super::ControlType`] directly.
#[derive(Default)]
pub struct Handlers {
    table: RwLock<HashMap<AppType, Handler>>,
}

impl Handlers {
    /// # Panics
    ///
    /// Panics if `msg_type` is negative.
    pub fn register<F>(&self, msg_type: i32, handler: F)
    where
        F: Fn(&Envelope<'_>, Option<SocketAddr>) + Send + Sync + 'static,
    {
        let msg_type = AppType::new(msg_type);
        self.table
            .write()
            .unwrap()
            .insert(msg_type, Arc::new(handler));
    }

    /// Invoke the handler registered for the envelope's type.
    ///
    /// Returns false for control types and for types nobody registered. A handler that panics
    /// is logged and the message dropped, the engine keeps running.
    pub fn dispatch(&self, env: &Envelope<'_>, source: Option<SocketAddr>) -> bool {
        let msg_type = match env.kind() {
            MessageKind::App(t) => t,
            _ => return false,
        };

        // cloned out so a handler may register others without deadlocking
        let handler = self.table.read().unwrap().get(&msg_type).cloned();
        match handler {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(env, source))).is_err() {
                    log::error!(
                        "handler for message type {} from {} panicked",
                        msg_type.code(),
                        env.sender
                    );
                }
                true
            }
            None => {
                log::trace!("no handler for message type {}", msg_type.code());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{decode, encode, ControlType, MeshId};
    use std::sync::Mutex;

    type Seen = Arc<Mutex<Vec<(MeshId, i32, Vec<u8>, Option<SocketAddr>)>>>;

    fn recording(handlers: &Handlers, msg_type: i32) -> Seen {
        let seen: Seen = Default::default();
        let sink = seen.clone();
        handlers.register(msg_type, move |env, source| {
            sink.lock()
                .unwrap()
                .push((env.sender, env.msg_type, env.payload.to_vec(), source));
        });
        seen
    }

    #[test]
    fn test_round_trip_dispatch() {
        let handlers = Handlers::default();
        let id = MeshId::random();
        let source: SocketAddr = "192.0.2.1:4000".parse().unwrap();

        let cases = [(0, &b""[..]), (7, &b"hello"[..]), (i32::MAX, &[0u8; 1200][..])];
        for (msg_type, payload) in cases {
            let seen = recording(&handlers, msg_type);
            let buf = encode(&id, msg_type, payload);
            let env = decode(&buf).unwrap();
            assert!(handlers.dispatch(&env, Some(source)));

            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0], (id, msg_type, payload.to_vec(), Some(source)));
        }
    }

    #[test]
    fn test_bad_magic_never_dispatched() {
        let handlers = Handlers::default();
        let seen = recording(&handlers, 1);
        let id = MeshId::random();

        for magic in [*b"UDPN", *b"udpm", [0; 4], *b"MPDU"] {
            let mut buf = encode(&id, 1, b"payload");
            buf[..4].copy_from_slice(&magic);
            if let Some(env) = decode(&buf) {
                handlers.dispatch(&env, None);
            }
        }

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_and_control_types_ignored() {
        let handlers = Handlers::default();
        let seen = recording(&handlers, 1);
        let id = MeshId::random();

        let unknown = encode(&id, 2, b"x");
        assert!(!handlers.dispatch(&decode(&unknown).unwrap(), None));

        let control = encode(&id, ControlType::Heartbeat.code(), &[0; 8]);
        assert!(!handlers.dispatch(&decode(&control).unwrap(), None));

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let handlers = Handlers::default();
        let seen: Seen = Default::default();
        {
            let sink = seen.clone();
            handlers.register(5, move |env, source| {
                assert_ne!(env.payload, b"boom");
                sink.lock()
                    .unwrap()
                    .push((env.sender, env.msg_type, env.payload.to_vec(), source));
            });
        }
        let id = MeshId::random();

        let boom = encode(&id, 5, b"boom");
        assert!(handlers.dispatch(&decode(&boom).unwrap(), None));
        let ok = encode(&id, 5, b"ok");
        assert!(handlers.dispatch(&decode(&ok).unwrap(), None));

        assert_eq!(*seen.lock().unwrap(), vec![(id, 5, b"ok".to_vec(), None)]);
    }

    #[test]
    #[should_panic]
    fn test_register_negative_type() {
        Handlers::default().register(-1, |_, _| {});
    }
}
