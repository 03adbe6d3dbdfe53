//! FSC control-channel service — connection establishment, heartbeat
//! maintenance and timeout-driven teardown against the remote RFSS.
//!
//! Two tasks run per service: a listen task blocked on the control socket
//! and a maintenance task ticking every heartbeat period. Session state is
//! shared behind one mutex; no lock is held across socket I/O.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::codec::fsc;

/// Maintenance cycles to wait for a connect response before giving up.
pub const MAX_CONNECT_WAIT_CYCLES: u32 = 10;
/// Missed heartbeat periods before the link is declared dead.
pub const MAX_MISSED_HEARTBEATS: u32 = 5;

/// Connection state for one remote RFSS.
#[derive(Debug)]
pub struct ControlSession {
    pub established: bool,
    pub req_connection: bool,
    pub last_ping: Instant,
    pub cycles_since_connect_req: u32,
    /// Voice-conveyance base port learned from the remote's response.
    pub vc_base_port: u16,
    next_correlation_tag: u8,
}

impl ControlSession {
    fn new() -> Self {
        ControlSession {
            established: false,
            req_connection: false,
            last_ping: Instant::now(),
            cycles_since_connect_req: 0,
            vc_base_port: 0,
            next_correlation_tag: 0,
        }
    }

    fn next_tag(&mut self) -> u8 {
        let tag = self.next_correlation_tag;
        self.next_correlation_tag = self.next_correlation_tag.wrapping_add(1);
        tag
    }

    fn clear(&mut self) {
        self.established = false;
        self.req_connection = false;
        self.cycles_since_connect_req = 0;
        self.vc_base_port = 0;
    }
}

/// Notifications from the control service to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Connection established; carries the remote voice-conveyance port.
    Connected { vc_base_port: u16 },
    Disconnected,
}

struct Shared {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    session: Mutex<ControlSession>,
    events: mpsc::UnboundedSender<ControlEvent>,
    /// Our advertised voice-conveyance port.
    local_vc_port: u16,
    ssrc: u32,
    heartbeat: Duration,
}

/// A running FSC control service.
pub struct ControlService {
    shared: Arc<Shared>,
    listen_handle: Option<tokio::task::JoinHandle<()>>,
    maint_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ControlService {
    /// Bind the control socket, send the initial CONNECT and start the
    /// listen and maintenance tasks.
    pub async fn start(
        local_port: u16,
        remote: SocketAddr,
        local_vc_port: u16,
        ssrc: u32,
        heartbeat_secs: u64,
        events: mpsc::UnboundedSender<ControlEvent>,
    ) -> Result<Self> {
        let bind_addr = format!("0.0.0.0:{}", local_port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind control socket on {}", bind_addr))?;
        tracing::info!(
            "FSC control bound to {}, remote: {}",
            socket.local_addr()?,
            remote
        );

        let shared = Arc::new(Shared {
            socket: Arc::new(socket),
            remote,
            session: Mutex::new(ControlSession::new()),
            events,
            local_vc_port,
            ssrc,
            heartbeat: Duration::from_secs(heartbeat_secs),
        });

        connect(&shared).await;

        let listen_handle = {
            let shared = shared.clone();
            Some(tokio::spawn(listen_loop(shared)))
        };
        let maint_handle = {
            let shared = shared.clone();
            Some(tokio::spawn(maintenance_loop(shared)))
        };

        Ok(ControlService {
            shared,
            listen_handle,
            maint_handle,
        })
    }

    /// Stop both tasks; sends a DISCONNECT first when connected. Idempotent.
    pub async fn stop(&mut self) {
        let disconnect = {
            let mut session = self.shared.session.lock().await;
            let was = session.established;
            let tag = session.next_tag();
            session.clear();
            was.then_some(tag)
        };
        if let Some(correlation_tag) = disconnect {
            send_message(&self.shared, &fsc::Message::Disconnect { correlation_tag }).await;
        }

        if let Some(h) = self.listen_handle.take() {
            h.abort();
            let _ = h.await;
        }
        if let Some(h) = self.maint_handle.take() {
            h.abort();
            let _ = h.await;
        }
        tracing::info!("FSC control stopped");
    }
}

impl Drop for ControlService {
    fn drop(&mut self) {
        if let Some(h) = self.listen_handle.take() {
            h.abort();
        }
        if let Some(h) = self.maint_handle.take() {
            h.abort();
        }
    }
}

async fn send_message(shared: &Shared, msg: &fsc::Message) {
    if let Err(e) = shared.socket.send_to(&msg.encode(), shared.remote).await {
        tracing::error!("FSC send failed: {:#}", e);
    }
}

/// Send CONNECT and arm the response wait.
async fn connect(shared: &Shared) {
    let correlation_tag = {
        let mut session = shared.session.lock().await;
        session.req_connection = true;
        session.cycles_since_connect_req = 0;
        session.next_tag()
    };
    let heartbeat = shared.heartbeat.as_secs() as u8;
    tracing::info!("FSC connecting to {}", shared.remote);
    send_message(
        shared,
        &fsc::Message::Connect(fsc::Connect {
            correlation_tag,
            vc_base_port: shared.local_vc_port,
            vc_ssrc: shared.ssrc,
            fs_heartbeat_period: heartbeat,
            host_heartbeat_period: heartbeat,
        }),
    )
    .await;
}

async fn listen_loop(shared: Arc<Shared>) {
    let mut buf = [0u8; 512];
    loop {
        match shared.socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if from != shared.remote {
                    tracing::warn!("Dropping FSC packet from unexpected endpoint {}", from);
                    continue;
                }
                match fsc::Message::decode(&buf[..len]) {
                    Ok(msg) => handle_message(&shared, msg).await,
                    Err(e) => tracing::error!("Dropping malformed FSC message: {}", e),
                }
            }
            Err(e) => {
                tracing::error!("FSC recv error: {:#}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_message(shared: &Shared, msg: fsc::Message) {
    match msg {
        fsc::Message::Heartbeat => {
            {
                let mut session = shared.session.lock().await;
                session.last_ping = Instant::now();
            }
            send_message(
                shared,
                &fsc::Message::Ack(fsc::Ack {
                    ack_message_id: fsc::FSC_HEARTBEAT,
                    ack_version: fsc::FSC_VERSION,
                    ack_correlation_tag: 0,
                    response_code: fsc::ResponseCode::ControlAck,
                    response_data: Vec::new(),
                }),
            )
            .await;
        }

        fsc::Message::Ack(ack) => {
            if ack.response_code.is_nak() {
                tracing::error!(
                    "FSC NAK ({:?}) for message id {}",
                    ack.response_code,
                    ack.ack_message_id
                );
                return;
            }
            let mut session = shared.session.lock().await;
            session.last_ping = Instant::now();
            if let Some(resp) = ack.connect_response() {
                if session.req_connection {
                    session.req_connection = false;
                    session.established = true;
                    session.vc_base_port = resp.vc_base_port;
                    tracing::info!(
                        "FSC connection established, remote VC port {}",
                        resp.vc_base_port
                    );
                    let _ = shared.events.send(ControlEvent::Connected {
                        vc_base_port: resp.vc_base_port,
                    });
                }
            }
        }

        fsc::Message::Connect(c) => {
            // Inverse role: the remote initiates; answer with our VC port.
            tracing::info!(
                "FSC CONNECT from remote (VC port {}), answering",
                c.vc_base_port
            );
            {
                let mut session = shared.session.lock().await;
                session.last_ping = Instant::now();
                session.vc_base_port = c.vc_base_port;
            }
            send_message(
                shared,
                &fsc::Message::Ack(fsc::Ack {
                    ack_message_id: fsc::FSC_CONNECT,
                    ack_version: fsc::FSC_VERSION,
                    ack_correlation_tag: c.correlation_tag,
                    response_code: fsc::ResponseCode::ControlAck,
                    response_data: fsc::ConnectResponse {
                        vc_base_port: shared.local_vc_port,
                    }
                    .encode(),
                }),
            )
            .await;
        }

        fsc::Message::Disconnect { .. } => {
            let was_established = {
                let mut session = shared.session.lock().await;
                let was = session.established;
                session.clear();
                was
            };
            if was_established {
                tracing::info!("FSC remote disconnected");
                let _ = shared.events.send(ControlEvent::Disconnected);
            }
        }
    }
}

async fn maintenance_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.heartbeat);
    interval.tick().await; // the immediate first tick
    loop {
        interval.tick().await;
        maintenance_tick(&shared).await;
    }
}

async fn maintenance_tick(shared: &Shared) {
    enum Action {
        None,
        Heartbeat,
        Timeout(u8),
    }

    let action = {
        let mut session = shared.session.lock().await;
        if session.req_connection {
            session.cycles_since_connect_req += 1;
            if session.cycles_since_connect_req > MAX_CONNECT_WAIT_CYCLES {
                tracing::error!(
                    "FSC connect timed out after {} cycles",
                    session.cycles_since_connect_req
                );
                session.clear();
            }
            Action::None
        } else if session.established {
            let silence = session.last_ping.elapsed();
            if silence > shared.heartbeat * MAX_MISSED_HEARTBEATS {
                tracing::error!(
                    "FSC heartbeat timeout ({:.1}s of silence), disconnecting",
                    silence.as_secs_f64()
                );
                let tag = session.next_tag();
                session.clear();
                Action::Timeout(tag)
            } else {
                Action::Heartbeat
            }
        } else {
            Action::None
        }
    };

    match action {
        Action::None => {}
        Action::Heartbeat => send_message(shared, &fsc::Message::Heartbeat).await,
        Action::Timeout(correlation_tag) => {
            send_message(shared, &fsc::Message::Disconnect { correlation_tag }).await;
            let _ = shared.events.send(ControlEvent::Disconnected);
        }
    }
}
