//! The polling state machine.
//!
//! One cycle walks a fixed sequence of requests: identity, pack measurement, geometry, then
//! for every tower a start-measuring write, the settle wait, a progress read and the five
//! tower detail pages. Any transport error aborts the whole cycle; the next call to
//! [`Poller::poll_cycle`] starts over from [`State::Identity`].

use crate::protocol::{
    decode_geometry, decode_identity, decode_measurement, DetailPage, Request, Variant,
    EXCHANGE_TIMEOUT, MESSAGE_DELAY, SETTLE_DELAY,
};
use crate::telemetry::{EnergyDelta, Snapshot, Telemetry};
use crate::transport::{Connector, Session};
use crate::Result;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Identity,
    Measurement,
    Geometry,
    StartMeasuring { tower: u8 },
    Settle { tower: u8 },
    MeasuringProgress { tower: u8 },
    TowerDetail { tower: u8, page: DetailPage },
    Complete,
}

impl State {
    /// Request sent in this state, `None` for the states that only wait.
    pub fn request(&self) -> Option<Request> {
        match self {
            State::Identity => Some(Request::Identity),
            State::Measurement => Some(Request::Measurement),
            State::Geometry => Some(Request::Geometry),
            State::StartMeasuring { tower } => Some(Request::StartMeasuring { tower: *tower }),
            State::Settle { .. } => None,
            State::MeasuringProgress { .. } => Some(Request::MeasuringProgress),
            State::TowerDetail { .. } => Some(Request::TowerDetail),
            State::Complete => None,
        }
    }

    pub fn next(&self, towers: u8) -> State {
        match *self {
            State::Identity => State::Measurement,
            State::Measurement => State::Geometry,
            State::Geometry => State::StartMeasuring { tower: 0 },
            State::StartMeasuring { tower } => State::Settle { tower },
            State::Settle { tower } => State::MeasuringProgress { tower },
            State::MeasuringProgress { tower } => State::TowerDetail {
                tower,
                page: DetailPage::Summary,
            },
            State::TowerDetail { tower, page } => match page.next() {
                Some(page) => State::TowerDetail { tower, page },
                None if tower + 1 < towers => State::StartMeasuring { tower: tower + 1 },
                None => State::Complete,
            },
            State::Complete => State::Identity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub variant: Variant,
    pub exchange_timeout: Duration,
    pub message_delay: Duration,
    pub settle_delay: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            variant: Variant::default(),
            exchange_timeout: EXCHANGE_TIMEOUT,
            message_delay: MESSAGE_DELAY,
            settle_delay: SETTLE_DELAY,
        }
    }
}

/// Polls one battery. Use one poller per device, pollers share nothing.
#[derive(Debug)]
pub struct Poller<C: Connector> {
    connector: C,
    config: PollerConfig,
    state: State,
    telemetry: Telemetry,
    last_snapshot: Option<Snapshot>,
}

impl<C: Connector> Poller<C> {
    pub fn new(connector: C, config: PollerConfig) -> Self {
        Self {
            connector,
            config,
            state: State::Identity,
            telemetry: Telemetry::default(),
            last_snapshot: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Everything decoded so far, including values left over from aborted cycles.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Result of the most recent completed cycle.
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    /// Runs one complete cycle. The session is closed and the machine is back in
    /// [`State::Identity`] when this returns, whatever the outcome.
    pub fn poll_cycle(&mut self) -> Result<Snapshot> {
        let result = self.open_and_run();
        if let Err(err) = &result {
            log::warn!("Poll cycle aborted in state {:?}: {}", self.state, err);
        }
        self.state = State::Identity;
        result
    }

    fn open_and_run(&mut self) -> Result<Snapshot> {
        let mut session = self.connector.open()?;
        let result = self.run(&mut session);
        session.close();
        result
    }

    fn run(&mut self, session: &mut C::Session) -> Result<Snapshot> {
        self.state = State::Identity;
        loop {
            let state = self.state;
            if state == State::Complete {
                return Ok(self.complete());
            }
            self.step(session, state)?;
            let towers = self.config.variant.tower_count(&self.telemetry.identity);
            self.state = state.next(towers);
            log::debug!("{:?} -> {:?}", state, self.state);
        }
    }

    fn step(&mut self, session: &mut C::Session, state: State) -> Result<()> {
        if let State::Settle { tower } = state {
            log::info!(
                "Waiting {:?} for tower {} to measure cells",
                self.config.settle_delay,
                tower
            );
            std::thread::sleep(self.config.settle_delay);
            return Ok(());
        }
        if let Some(request) = state.request() {
            let tx_buffer = request.frame()?;
            let rx_buffer = session.exchange(&tx_buffer, self.config.exchange_timeout)?;
            self.decode(state, &rx_buffer);
            std::thread::sleep(self.config.message_delay);
        }
        Ok(())
    }

    fn decode(&mut self, state: State, rx_buffer: &[u8]) {
        let telemetry = &mut self.telemetry;
        match state {
            State::Identity => {
                decode_identity(rx_buffer, self.config.variant, &mut telemetry.identity)
            }
            State::Measurement => decode_measurement(rx_buffer, &mut telemetry.measurement),
            State::Geometry => {
                decode_geometry(rx_buffer, &telemetry.identity, &mut telemetry.geometry)
            }
            State::TowerDetail { tower, page } => {
                let geometry = telemetry.geometry;
                page.decode(rx_buffer, &geometry, telemetry.tower_mut(tower));
            }
            _ => {}
        }
    }

    fn complete(&mut self) -> Snapshot {
        let previous = self.last_snapshot.as_ref().map(|s| &s.telemetry.towers);
        let energy: BTreeMap<u8, EnergyDelta> = self
            .telemetry
            .towers
            .iter()
            .map(|(index, tower)| {
                let before = previous.and_then(|towers| towers.get(index));
                (*index, EnergyDelta::between(before, tower))
            })
            .collect();
        let snapshot = Snapshot {
            telemetry: self.telemetry.clone(),
            energy,
            completed_at: SystemTime::now(),
        };
        log::info!(
            "Poll cycle complete: serial={} soc={} voltage={} towers={}",
            snapshot.telemetry.identity.serial,
            snapshot.telemetry.measurement.soc,
            snapshot.telemetry.measurement.voltage,
            snapshot.telemetry.towers.len()
        );
        self.last_snapshot = Some(snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(towers: u8) -> Vec<State> {
        let mut states = vec![State::Identity];
        let mut state = State::Identity;
        while state != State::Complete {
            state = state.next(towers);
            states.push(state);
        }
        states
    }

    #[test]
    fn single_tower_sequence() {
        let states = walk(1);
        assert_eq!(
            &states[..6],
            &[
                State::Identity,
                State::Measurement,
                State::Geometry,
                State::StartMeasuring { tower: 0 },
                State::Settle { tower: 0 },
                State::MeasuringProgress { tower: 0 },
            ]
        );
        assert_eq!(
            states[6],
            State::TowerDetail {
                tower: 0,
                page: DetailPage::Summary
            }
        );
        assert_eq!(
            states[10],
            State::TowerDetail {
                tower: 0,
                page: DetailPage::ExtendedCells
            }
        );
        assert_eq!(states[11], State::Complete);
        assert_eq!(states.len(), 12);
    }

    #[test]
    fn every_tower_is_measured() {
        let states = walk(2);
        assert_eq!(states.len(), 12 + 8);
        assert_eq!(states[11], State::StartMeasuring { tower: 1 });
        assert_eq!(states[12], State::Settle { tower: 1 });
        assert_eq!(states[19], State::Complete);
    }

    #[test]
    fn waiting_states_send_nothing() {
        assert_eq!(State::Settle { tower: 0 }.request(), None);
        assert_eq!(State::Complete.request(), None);
        assert_eq!(State::Complete.next(1), State::Identity);
    }

    #[test]
    fn default_timing() {
        let config = PollerConfig::default();
        assert_eq!(config.exchange_timeout, Duration::from_secs(1));
        assert_eq!(config.message_delay, Duration::from_millis(200));
        assert_eq!(config.settle_delay, Duration::from_secs(3));
        assert_eq!(config.variant, Variant::SingleTower);
    }
}
