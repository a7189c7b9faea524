// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Async runtime: wires the engine to a transport and the timer manager.
//!
//! The engine stays single-threaded; this module owns the event loop that
//! feeds it. Received packets and data notifications are injected through a
//! [`RuntimeHandle`]; timer expiries arrive from the spawned
//! [`TimerManager`](crate::timers::TimerManager) task. Every
//! [`EngineActions`] bundle is applied in order: timer cancellations first,
//! then schedules, then packet and data transmission through the
//! [`Transport`].

use anyhow::Context;
use tokio::sync::mpsc;

use crate::engine::{EngineActions, PimDmEngine, PimDmEvent};
use crate::logging::{Facility, Logger};
use crate::timers::{TimerCommand, TimerManager};
use crate::{log_info, log_warning};
use crate::{DataForward, OutgoingPacket};

/// Bound on buffered events and timer commands
const CHANNEL_CAPACITY: usize = 256;

/// Packet and data egress. Implementations wrap raw PIM sockets or, in
/// tests, a recording sink. Sends are synchronous; a raw-socket send either
/// completes or fails immediately.
pub trait Transport {
    /// Transmit an encoded control packet. `packet.interface == None`
    /// means unicast routing (Graft/GraftAck).
    fn send_packet(&mut self, packet: &OutgoingPacket) -> anyhow::Result<()>;

    /// Copy a data packet onto the listed interfaces
    fn forward_data(&mut self, forward: &DataForward) -> anyhow::Result<()>;
}

/// Cloneable handle for injecting events into a running runtime
#[derive(Clone)]
pub struct RuntimeHandle {
    events: mpsc::Sender<PimDmEvent>,
}

impl RuntimeHandle {
    /// Queue an event for the engine. Fails once the runtime has stopped.
    pub async fn inject(&self, event: PimDmEvent) -> anyhow::Result<()> {
        self.events
            .send(event)
            .await
            .context("runtime event loop has stopped")
    }
}

/// The event loop around a [`PimDmEngine`]
pub struct PimDmRuntime<T: Transport> {
    engine: PimDmEngine,
    transport: T,
    event_rx: mpsc::Receiver<PimDmEvent>,
    command_tx: mpsc::Sender<TimerCommand>,
    expiry_rx: mpsc::Receiver<crate::timers::TimerType>,
    /// Spawned on the first `run` call
    timer_manager: Option<TimerManager>,
    logger: Logger,
}

impl<T: Transport> PimDmRuntime<T> {
    pub fn new(engine: PimDmEngine, transport: T, logger: Logger) -> (Self, RuntimeHandle) {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (expiry_tx, expiry_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let timer_manager = TimerManager::new(command_rx, expiry_tx, logger.clone());
        (
            Self {
                engine,
                transport,
                event_rx,
                command_tx,
                expiry_rx,
                timer_manager: Some(timer_manager),
                logger,
            },
            RuntimeHandle { events: event_tx },
        )
    }

    pub fn engine(&self) -> &PimDmEngine {
        &self.engine
    }

    /// Mutable engine access for control operations (enabling interfaces,
    /// registering flows). The returned actions must be fed to [`apply`].
    ///
    /// [`apply`]: PimDmRuntime::apply
    pub fn engine_mut(&mut self) -> &mut PimDmEngine {
        &mut self.engine
    }

    /// Apply one actions bundle: cancels, then schedules, then sends
    pub async fn apply(&mut self, actions: EngineActions) -> anyhow::Result<()> {
        for timer_type in actions.cancels {
            self.command_tx
                .send(TimerCommand::Cancel(timer_type))
                .await
                .context("timer manager has stopped")?;
        }
        for request in actions.timers {
            self.command_tx
                .send(TimerCommand::Schedule(request))
                .await
                .context("timer manager has stopped")?;
        }
        for packet in &actions.packets {
            if let Err(error) = self.transport.send_packet(packet) {
                log_warning!(
                    self.logger,
                    Facility::Engine,
                    "failed to send {}: {}",
                    packet.message.type_name(),
                    error
                );
            }
        }
        for forward in &actions.forwards {
            if let Err(error) = self.transport.forward_data(forward) {
                log_warning!(
                    self.logger,
                    Facility::Forwarding,
                    "failed to forward data for {}: {}",
                    forward.sg,
                    error
                );
            }
        }
        Ok(())
    }

    /// Run until every [`RuntimeHandle`] is dropped
    pub async fn run(&mut self) -> anyhow::Result<()> {
        if let Some(manager) = self.timer_manager.take() {
            tokio::spawn(manager.run());
            let now = tokio::time::Instant::now().into_std();
            let actions = self.engine.start(now);
            self.apply(actions).await?;
        }

        loop {
            let event = tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                expiry = self.expiry_rx.recv() => match expiry {
                    Some(timer_type) => PimDmEvent::TimerExpired(timer_type),
                    None => break,
                },
            };

            let now = tokio::time::Instant::now().into_std();
            match self.engine.handle_event(event, now) {
                Ok(actions) => self.apply(actions).await?,
                Err(error) => {
                    log_warning!(self.logger, Facility::Engine, "event rejected: {}", error);
                }
            }
        }

        log_info!(self.logger, Facility::Engine, "event loop stopped");
        Ok(())
    }
}
