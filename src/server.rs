use crate::{
    config::Config,
    sensors::{self, Streams},
};

use std::{
    io::ErrorKind::ConnectionReset,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use tokio::{net::UdpSocket, time};

use codec::MAX_PDU_SIZE;
use service::{
    Endpoint, EndpointOptions, Transport,
    queue::{TICKS_PER_SECOND, Tick},
};

/// Maps wall-clock time onto engine ticks (1024 per second). The engine
/// itself never reads a clock; this loop passes the current tick into
/// every call.
pub struct TickClock {
    origin: Instant,
}

impl TickClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> Tick {
        self.origin.elapsed().as_millis() as Tick * TICKS_PER_SECOND / 1000
    }

    /// Delay until `deadline`, zero when it already passed.
    pub fn until(&self, deadline: Tick) -> Duration {
        let now = self.now();
        if deadline <= now {
            Duration::ZERO
        } else {
            Duration::from_millis((deadline - now) * 1000 / TICKS_PER_SECOND)
        }
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct UdpTransport(Arc<UdpSocket>);

impl Transport for UdpTransport {
    fn send(&self, to: &SocketAddr, bytes: &[u8]) -> std::io::Result<usize> {
        self.0.try_send_to(bytes, *to)
    }
}

/// UDP event loop.
///
/// Alternates the three engine operations: drain readable datagrams
/// through receive and dispatch, fire retransmissions when the earliest
/// send-queue entry is due, and push notifications to the observed
/// resources' subscribers on the check interval.
pub async fn run(config: Arc<Config>) -> Result<()> {
    let socket = Arc::new(UdpSocket::bind(config.server.listen).await?);
    let local = socket.local_addr()?;
    log::info!("coap server listening: addr={local}");

    let mut endpoint = Endpoint::new(EndpointOptions {
        local,
        transport: UdpTransport(socket.clone()),
    });

    endpoint.set_response_handler(|peer, _request, response, id| {
        log::info!(
            "response from {peer}: code={}, transaction={id}",
            response.code()
        );
    });

    let streams = Streams::default();
    sensors::register_all(&mut endpoint, &streams);

    let clock = TickClock::new();
    let mut check = time::interval(Duration::from_secs(config.server.check_interval.max(1)));
    let mut buffer = vec![0u8; MAX_PDU_SIZE];

    loop {
        let deadline = endpoint.next_retransmit();

        tokio::select! {
            result = socket.recv_from(&mut buffer) => {
                match result {
                    Ok((size, addr)) => {
                        let now = clock.now();
                        // A malformed frame was already answered or
                        // dropped inside the engine.
                        let _ = endpoint.receive(&buffer[..size], addr, now);
                        endpoint.dispatch(now);
                    }
                    // Note: An error is also reported when a remote
                    // host is shut down; a datagram socket keeps
                    // working past that.
                    Err(error) if error.kind() == ConnectionReset => continue,
                    Err(error) => return Err(error.into()),
                }
            }
            _ = time::sleep(deadline.map(|t| clock.until(t)).unwrap_or(Duration::from_secs(3600))), if deadline.is_some() => {
                endpoint.retransmit(clock.now());
            }
            _ = check.tick() => {
                publish(&mut endpoint, &streams, &clock);
            }
        }
    }
}

/// Pushes one notification to every live subscriber, confirmable when
/// the observer's cadence demands it.
fn publish<T: Transport>(endpoint: &mut Endpoint<T>, streams: &Streams, clock: &TickClock) {
    let now = clock.now();

    for reg in streams.snapshot() {
        if reg.is_invalid() {
            continue;
        }

        let Some(sensor) = sensors::kind_for(reg.reskey()) else {
            continue;
        };

        let mid = endpoint.next_message_id();
        let confirmable = reg.next_is_confirmable();

        let (pdu, octets) = match sensors::notification(&reg, sensor, confirmable, mid) {
            Ok(built) => built,
            Err(error) => {
                log::warn!("cannot build notification for {}: {error}", reg.peer());
                continue;
            }
        };

        let sent = if confirmable {
            endpoint
                .notify_confirmed(reg.peer(), pdu, reg.checkout(), now)
                .is_some()
        } else {
            endpoint.send(&reg.peer(), &pdu).is_some()
        };

        if sent {
            reg.note_sent(octets as u64);
        }
    }
}
