//! Messages from center.

use bytes::Bytes;
use std::net::SocketAddr;
use tether_core::Tick;
use tether_protocol::{ip_from_wire, ControlMessage, Rates, WireMessage};
use tracing::{debug, info, warn};

use super::ChannelState;
use crate::{metrics, net};

impl ChannelState {
    /// Dispatch one message from center.
    pub(super) fn handle_control(&mut self, tick: &Tick, message: ControlMessage) {
        let kind = message.kind();
        match message {
            ControlMessage::Ping { .. } | ControlMessage::Pong { .. } => {}
            ControlMessage::ServerAssignmentResult {
                in_migration,
                channel_id,
            } => self.on_assignment(tick, channel_id, in_migration),
            ControlMessage::ServerMigrationUpdate { status, payload } => {
                self.on_migration_update(tick, status, payload);
            }
            ControlMessage::PlayerChangeServerResult {
                session,
                character_id,
                ip,
                port,
            } => self.on_transfer_result(&session, character_id, ip, port),
            ControlMessage::PlayerChangeServerData {
                character_id,
                state,
            } => {
                debug!(character = character_id, bytes = state.len(), "Buffering hand-off");
                self.handoffs
                    .insert(character_id, Bytes::from(state), tick.current_time());
                metrics::record_handoff("buffered");
            }
            ControlMessage::ChangeCenterServer { ip, port } => {
                let addr = SocketAddr::from((ip_from_wire(ip), port));
                info!(%addr, "Center is moving");
                self.expecting_center_change = true;
                self.settings.center_addr = addr;
                self.dialing = true;
                self.io.dial_center(addr);
            }
            ControlMessage::ChangeRates { rates } => self.on_rates(&rates),
            ControlMessage::AdminMessage { message, kind } => {
                self.game.on_admin_message(&message, kind);
            }
            ControlMessage::KickPlayerResult { user_id } => self.kick_account(user_id),
            ControlMessage::Relay {
                kind,
                character_id,
                payload,
            } => {
                if self.characters.contains_key(&character_id) {
                    self.game.on_relay(kind, character_id, &payload);
                } else {
                    debug!(character = character_id, ?kind, "Relay for a player not here");
                }
            }
            ControlMessage::ServerRequestAllocation { .. }
            | ControlMessage::ServerSetConnectionsValue { .. }
            | ControlMessage::ServerRegisterPlayer { .. }
            | ControlMessage::ServerUnregisterPlayer { .. }
            | ControlMessage::PlayerChangeServer { .. }
            | ControlMessage::KickPlayer { .. } => {
                if let Some(center) = &self.center {
                    net::drop_unexpected(&**center, kind, "from center");
                }
            }
        }
    }

    fn on_assignment(&mut self, tick: &Tick, channel_id: u8, in_migration: bool) {
        if let Some(previous) = self.channel_id.filter(|previous| *previous != channel_id) {
            warn!(previous, channel_id, "Center assigned a different channel id");
        }
        info!(name = %self.settings.name, channel_id, in_migration, "Registered with center");

        self.channel_id = Some(channel_id);
        self.registered = true;
        self.expecting_center_change = false;
        self.center_attempts = 0;
        if let Some(id) = self.watchdog.take() {
            self.scheduler.cancel(id);
        }

        if in_migration {
            self.begin_replacement_migration(tick);
        } else if !self.io.is_listening()
            && !self.shutting_down
            && !self.migration.phase().is_active()
        {
            if let Err(e) = self.io.start_listening() {
                self.alerts
                    .alert(&format!("{} cannot accept clients: {}", self.settings.name, e));
                self.exit(1);
                return;
            }
            info!(port = self.settings.port, "Accepting clients");
            self.start_handoff_reaper();
        } else {
            info!(players = self.characters.len(), "Reconnected to center");
            self.announce_players();
        }

        self.reported_connections = None;
        self.report_connections();
    }

    fn on_rates(&mut self, update: &Rates) {
        if self.rates.merge(update) {
            info!(rates = ?self.rates, "World rates changed");
            self.game.on_rates_changed(&self.rates);
        }
        self.send_to_center(&ControlMessage::ChangeRates { rates: self.rates });
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;
    use tether_protocol::{ClientMessage, RelayKind};
    use tether_transport::Connection;

    #[test]
    fn test_assignment_starts_listener() {
        let mut harness = Harness::new();
        let center = harness.connect_center();
        center.take_sent();

        harness.control(ControlMessage::ServerAssignmentResult {
            in_migration: false,
            channel_id: 2,
        });

        assert_eq!(harness.state.channel_id(), Some(2));
        assert!(harness.io.lock().unwrap().listening);
        assert!(harness.state.reaper.is_some());
        assert_eq!(
            center.take_sent(),
            vec![ControlMessage::ServerSetConnectionsValue { count: 0 }]
        );
    }

    #[test]
    fn test_listener_failure_exits() {
        let mut harness = Harness::new();
        harness.io.lock().unwrap().fail_listen = true;
        harness.connect_center();
        harness.control(ControlMessage::ServerAssignmentResult {
            in_migration: false,
            channel_id: 2,
        });

        assert_eq!(harness.io.lock().unwrap().exits, vec![1]);
        assert_eq!(harness.alerts.messages().len(), 1);
    }

    #[test]
    fn test_reassignment_announces_loaded_players() {
        let (mut harness, _center) = Harness::registered(1);
        harness.login(7, 70);

        let center = harness.connect_center();
        center.take_sent();
        harness.control(ControlMessage::ServerAssignmentResult {
            in_migration: false,
            channel_id: 1,
        });

        let sent = center.take_sent();
        assert!(sent
            .iter()
            .any(|message| matches!(
                message,
                ControlMessage::ServerRegisterPlayer { character_id: 7, .. }
            )));
        assert!(sent.contains(&ControlMessage::ServerSetConnectionsValue { count: 1 }));
    }

    #[test]
    fn test_center_change_is_an_expected_disconnect() {
        let (mut harness, center) = Harness::registered(1);
        harness.io.lock().unwrap().dials.clear();

        harness.control(ControlMessage::ChangeCenterServer {
            ip: [10, 0, 0, 9],
            port: 8400,
        });
        let expected: SocketAddr = "10.0.0.9:8400".parse().unwrap();
        assert_eq!(harness.io.lock().unwrap().dials, vec![expected]);

        harness
            .state
            .on_center_event(
                &Tick::now(),
                tether_transport::ConnectionEvent::Closed { id: center.id() },
            );
        // No second dial and no alert: the new center is already being dialed.
        assert_eq!(harness.io.lock().unwrap().dials.len(), 1);
        assert!(harness.alerts.messages().is_empty());
        assert!(harness.io.lock().unwrap().listening);

        let new_center = harness.connect_center();
        assert!(matches!(
            new_center.take_sent().as_slice(),
            [ControlMessage::ServerRequestAllocation { .. }]
        ));
        harness.control(ControlMessage::ServerAssignmentResult {
            in_migration: false,
            channel_id: 1,
        });
        assert!(!harness.state.expecting_center_change);
        assert_eq!(harness.state.settings.center_addr, expected);
    }

    #[test]
    fn test_rates_are_merged_and_echoed() {
        let (mut harness, center) = Harness::registered(1);
        harness.control(ControlMessage::ChangeRates {
            rates: Rates::new(2.0, 0.0, 0.0),
        });
        harness.control(ControlMessage::ChangeRates {
            rates: Rates::new(2.0, 0.0, 0.0),
        });

        let merged = Rates::new(2.0, 1.0, 1.0);
        assert_eq!(harness.game.lock().unwrap().rates, vec![merged]);
        assert_eq!(
            center.take_sent(),
            vec![
                ControlMessage::ChangeRates { rates: merged },
                ControlMessage::ChangeRates { rates: merged },
            ]
        );
    }

    #[test]
    fn test_relay_only_for_players_here() {
        let (mut harness, _center) = Harness::registered(1);
        harness.login(7, 70);

        for character_id in [7, 8] {
            harness.control(ControlMessage::Relay {
                kind: RelayKind::Whisper,
                character_id,
                payload: b"hi".to_vec(),
            });
        }
        assert_eq!(
            harness.game.lock().unwrap().relays,
            vec![(RelayKind::Whisper, 7, b"hi".to_vec())]
        );
    }

    #[test]
    fn test_admin_message_reaches_game() {
        let (mut harness, _center) = Harness::registered(1);
        harness.control(ControlMessage::AdminMessage {
            message: "Maintenance in 5 minutes".into(),
            kind: 6,
        });
        assert_eq!(
            harness.game.lock().unwrap().admin,
            vec![("Maintenance in 5 minutes".to_string(), 6)]
        );
    }

    #[test]
    fn test_center_bound_message_drops_center_link() {
        let (mut harness, center) = Harness::registered(1);
        let client = harness.login(7, 70);
        center.take_sent();

        harness.control(ControlMessage::KickPlayer { user_id: 70 });

        assert!(!center.is_open());
        assert!(center.take_sent().is_empty());
        // The player stays; only the broken link goes.
        assert!(client.is_open());
        assert_eq!(client.take_sent(), Vec::<ClientMessage>::new());
    }

    #[test]
    fn test_dropped_center_link_is_redialed() {
        let (mut harness, center) = Harness::registered(1);
        harness.io.lock().unwrap().dials.clear();

        harness.control(ControlMessage::ServerSetConnectionsValue { count: 9 });
        assert!(!center.is_open());
        harness
            .state
            .on_center_event(
                &Tick::now(),
                tether_transport::ConnectionEvent::Closed { id: center.id() },
            );

        let expected: SocketAddr = "10.0.0.1:8383".parse().unwrap();
        assert_eq!(harness.io.lock().unwrap().dials, vec![expected]);
        assert!(harness.io.lock().unwrap().exits.is_empty());
    }
}
