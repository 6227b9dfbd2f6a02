//! Network controller
//!
//! Owns the UDP socket and demultiplexes inbound datagrams into replies,
//! transfer chunks, and fresh packets for the registered receiver. Sends
//! that expect a reply are retried and correlated through the reply table;
//! bulk data moves as paced 1024-byte chunks.

use crate::reply::ReplyTable;
use crate::transfer::DownloadTask;
use crate::wire::{json_keys, pack_udp_data, unpack_udp_data, DataPacket, NetworkError, PacketDict};
use crate::{DEFAULT_TIMEOUT, SEND_ATTEMPTS, SEQUENCE_ID_SIZE, STREAM_DATA_SIZE};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lib_events::{Event, EventId, EventPayload, EventReactor, EventScheduler, Task};
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error};

/// Receiver of packets that are not replies or transfer chunks.
///
/// The DHT engine implements this to dispatch RPCs.
pub trait PacketReceiver: Send + Sync {
    fn receive_packet(&self, packet: DataPacket);
}

/// Network controller bound to one UDP socket
pub struct Network {
    self_ref: Weak<Network>,
    local_addr: SocketAddr,
    reactor: Arc<EventReactor>,
    scheduler: EventScheduler,
    reply_table: ReplyTable,
    downloads: Mutex<HashMap<String, Arc<DownloadTask>>>,
    receive_handler: Mutex<Option<Weak<dyn PacketReceiver>>>,
    outbound_tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    udp_inbound_id: EventId,
    transfer_timer_id: EventId,
    shutdown: Arc<Notify>,
    running: AtomicBool,
}

impl Network {
    /// Bind the socket and wire the socket loops and reactor handlers.
    ///
    /// A port of 0 asks the OS to assign one.
    pub async fn new(
        reactor: Arc<EventReactor>,
        address: SocketAddr,
    ) -> Result<Arc<Self>, NetworkError> {
        let socket = Arc::new(UdpSocket::bind(address).await?);
        let local_addr = socket.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let network = Arc::new_cyclic(|weak| Network {
            self_ref: weak.clone(),
            local_addr,
            reactor: reactor.clone(),
            scheduler: EventScheduler::new(reactor.clone()),
            reply_table: ReplyTable::new(),
            downloads: Mutex::new(HashMap::new()),
            receive_handler: Mutex::new(None),
            outbound_tx,
            udp_inbound_id: EventId::new(),
            transfer_timer_id: EventId::new(),
            shutdown: shutdown.clone(),
            running: AtomicBool::new(true),
        });

        tokio::spawn(Self::receive_loop(
            socket.clone(),
            reactor.clone(),
            network.udp_inbound_id,
            shutdown.clone(),
        ));
        tokio::spawn(Self::send_loop(socket, outbound_rx, shutdown));

        network.register_handlers();

        debug!(%local_addr, "network started");

        Ok(network)
    }

    /// The bound address of the socket
    pub fn server_address(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register the component that receives non-reply packets.
    ///
    /// Held weakly so the receiver may own the network.
    pub fn set_receive_handler(&self, handler: &Arc<dyn PacketReceiver>) {
        *self.receive_handler.lock() = Some(Arc::downgrade(handler));
    }

    fn register_handlers(&self) {
        {
            let network = self.self_ref.clone();
            self.reactor.register_handler(self.udp_inbound_id, move |event| {
                if let (Some(network), EventPayload::Datagram { address, data }) =
                    (network.upgrade(), &event.payload)
                {
                    network.udp_incoming(*address, data);
                }
            });
        }

        {
            let network = self.self_ref.clone();
            self.reactor.register_handler(self.transfer_timer_id, move |event| {
                if let (Some(network), EventPayload::Transfer(transfer_id)) =
                    (network.upgrade(), &event.payload)
                {
                    network.clean_download(transfer_id);
                }
            });
        }

        {
            let network = self.self_ref.clone();
            self.reactor.register_handler(EventId::STOP, move |_| {
                if let Some(network) = network.upgrade() {
                    network.stop();
                }
            });
        }
    }

    async fn receive_loop(
        socket: Arc<UdpSocket>,
        reactor: Arc<EventReactor>,
        udp_inbound_id: EventId,
        shutdown: Arc<Notify>,
    ) {
        let mut buffer = vec![0u8; 65536];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, address)) => {
                            let event = Event::new(
                                udp_inbound_id,
                                EventPayload::Datagram {
                                    address,
                                    data: buffer[..len].to_vec(),
                                },
                            );

                            match reactor.put(event) {
                                Ok(()) => {}
                                Err(lib_events::EventError::Stopped) => break,
                                Err(err) => error!(%err, "dropping inbound datagram"),
                            }
                        }
                        Err(err) => {
                            debug!(%err, "udp receive error");
                        }
                    }
                }
                _ = shutdown.notified() => break,
            }
        }

        debug!("network udp receiver stopped");
    }

    async fn send_loop(
        socket: Arc<UdpSocket>,
        mut outbound_rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
        shutdown: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some((address, data)) => {
                            if let Err(err) = socket.send_to(&data, address).await {
                                debug!(%err, %address, "udp send error");
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.notified() => break,
            }
        }

        debug!("network udp sender stopped");
    }

    /// Stop and expire everything: downloads get an absent terminator and
    /// outstanding reply waiters are woken to observe no reply.
    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let downloads: Vec<Arc<DownloadTask>> = self.downloads.lock().drain().map(|(_, v)| v).collect();

        for download in downloads {
            download.feed(None);
        }

        self.reply_table.signal_outstanding();
        self.shutdown.notify_waiters();

        debug!("network stopped");
    }

    fn udp_incoming(&self, address: SocketAddr, data: &[u8]) {
        if !self.is_running() {
            return;
        }

        let payload = match unpack_udp_data(data) {
            Some(payload) => payload,
            None => return,
        };

        let packet = DataPacket::new(address, payload);

        if packet.payload.contains_key(json_keys::REPLY_SEQUENCE_ID) {
            if !self.reply_table.accept_reply(packet) {
                debug!(%address, "unknown reply correlation, packet discarded");
            }
        } else if packet.payload.contains_key(json_keys::TRANSFER_ID) {
            self.accept_transfer(packet);
        } else {
            let handler = self.receive_handler.lock().clone();

            if let Some(handler) = handler.and_then(|weak| weak.upgrade()) {
                handler.receive_packet(packet);
            }
        }
    }

    fn accept_transfer(&self, packet: DataPacket) {
        let transfer_id = match packet.get_str(json_keys::TRANSFER_ID) {
            Some(id) => id.to_string(),
            None => return,
        };

        let download = self.downloads.lock().get(&transfer_id).cloned();

        let download = match download {
            Some(download) if packet.payload.contains_key(json_keys::TRANSFER_DATA) => download,
            _ => {
                debug!("transfer discarded");
                return;
            }
        };

        download.set_address(packet.address);

        match packet.payload.get(json_keys::TRANSFER_DATA) {
            Some(Value::Null) => {
                download.feed(None);
                debug!(%transfer_id, "download finished");
            }
            Some(Value::String(encoded)) => {
                let data = match BASE64.decode(encoded) {
                    Ok(data) => data,
                    Err(err) => {
                        debug!(%err, "chunk decode error");
                        return;
                    }
                };

                let len = data.len();
                download.feed(Some(data));
                debug!(%transfer_id, len, "download chunk");

                if download.is_running() {
                    // Pace the sender
                    let mut reply = PacketDict::new();
                    reply.insert(
                        json_keys::TRANSFER_ID.to_string(),
                        Value::String(transfer_id),
                    );

                    let _ = self.send_answer_reply(&packet, reply);
                } else {
                    debug!("download aborted");
                }
            }
            _ => debug!("transfer discarded"),
        }
    }

    /// Allow a transfer for download under a pre-registered id.
    ///
    /// The inactivity timer arms now and re-arms on every received chunk;
    /// when it lapses the download terminates with whatever arrived.
    pub fn expect_incoming_transfer(
        &self,
        transfer_id: &str,
        timeout: Duration,
        max_size: Option<u64>,
    ) -> Arc<DownloadTask> {
        let download = DownloadTask::start(timeout, max_size);

        self.downloads
            .lock()
            .insert(transfer_id.to_string(), download.clone());

        self.scheduler.after(
            timeout,
            Event::new(
                self.transfer_timer_id,
                EventPayload::Transfer(transfer_id.to_string()),
            ),
        );

        download
    }

    /// Remove a download whose inactivity timer lapsed, or re-arm the timer
    fn clean_download(&self, transfer_id: &str) {
        let download = self.downloads.lock().get(transfer_id).cloned();

        let download = match download {
            Some(download) => download,
            None => return,
        };

        if download.last_modified() + download.timeout() < Instant::now() {
            debug!(transfer_id, "cleaned out download");
            self.downloads.lock().remove(transfer_id);
            download.feed(None);
        } else {
            debug!(transfer_id, "still alive download");
            self.scheduler.after(
                download.timeout(),
                Event::new(
                    self.transfer_timer_id,
                    EventPayload::Transfer(transfer_id.to_string()),
                ),
            );
        }
    }

    /// Send a payload as a single datagram with no reply expected
    pub fn send(&self, address: SocketAddr, payload: PacketDict) -> Result<(), NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::Stopped);
        }

        let data = pack_udp_data(&payload)?;
        let _ = self.outbound_tx.send((address, data));

        Ok(())
    }

    /// Send a payload and wait for its reply.
    ///
    /// The datagram is retried up to [`SEND_ATTEMPTS`] times with
    /// `timeout / attempts` between attempts. A missing reply is not an
    /// error; the task completes with `None`.
    pub fn send_expect_reply(
        &self,
        address: SocketAddr,
        mut payload: PacketDict,
        timeout: Duration,
    ) -> Result<Task<Option<DataPacket>>, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::Stopped);
        }

        let sequence_id = self.new_sequence_id();
        payload.insert(
            json_keys::SEQUENCE_ID.to_string(),
            Value::String(sequence_id.clone()),
        );

        let data = pack_udp_data(&payload)?;
        let notify = Arc::new(Notify::new());
        self.reply_table
            .add_out_entry(&sequence_id, address, notify.clone());

        let network = self.self_ref.upgrade().ok_or(NetworkError::Stopped)?;

        Ok(Task::spawn(move |ctx| async move {
            let attempt_timeout = timeout / SEND_ATTEMPTS;

            for attempt in 0..SEND_ATTEMPTS {
                if !ctx.is_running() || !network.is_running() {
                    break;
                }

                debug!(%address, attempt, "send packet attempt");
                let _ = network.outbound_tx.send((address, data.clone()));

                let _ = tokio::time::timeout(attempt_timeout, notify.notified()).await;

                if let Some(packet) = network.reply_table.take_in_entry(&sequence_id, address) {
                    debug!(%address, attempt, "send packet got reply");
                    return Some(packet);
                }
            }

            debug!(%address, "send packet no reply");
            network.reply_table.take_out_entry(&sequence_id, address);

            None
        }))
    }

    /// Send a payload as a reply to an incoming packet.
    ///
    /// Echoes the source packet's sequence id under the reply key.
    pub fn send_answer_reply(
        &self,
        source: &DataPacket,
        mut payload: PacketDict,
    ) -> Result<(), NetworkError> {
        let sequence_id = match &source.sequence_id {
            Some(id) => id.clone(),
            None => return Ok(()),
        };

        payload.insert(
            json_keys::REPLY_SEQUENCE_ID.to_string(),
            Value::String(sequence_id),
        );

        self.send(source.address, payload)
    }

    /// Transfer bytes to another client as paced chunks.
    ///
    /// The task result is the number of bytes the peer acknowledged.
    pub fn send_bytes(
        &self,
        address: SocketAddr,
        transfer_id: &str,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> Task<u64> {
        let network = self.self_ref.upgrade().expect("network alive");
        let transfer_id = transfer_id.to_string();

        debug!(%address, len = bytes.len(), "send bytes");

        Task::spawn(move |ctx| async move {
            let mut offset = 0usize;
            let mut progress = 0u64;

            while ctx.is_running() {
                let end = usize::min(offset + STREAM_DATA_SIZE, bytes.len());
                let chunk = &bytes[offset..end];

                let mut payload = PacketDict::new();
                payload.insert(
                    json_keys::TRANSFER_ID.to_string(),
                    Value::String(transfer_id.clone()),
                );

                if !chunk.is_empty() {
                    payload.insert(
                        json_keys::TRANSFER_DATA.to_string(),
                        Value::String(BASE64.encode(chunk)),
                    );

                    let reply_task =
                        match network.send_expect_reply(address, payload, timeout) {
                            Ok(task) => task,
                            Err(_) => break,
                        };

                    ctx.hook(&reply_task);
                    let reply = reply_task.result().await;

                    let acknowledged = reply
                        .as_ref()
                        .and_then(|packet| packet.get_str(json_keys::TRANSFER_ID))
                        .is_some_and(|id| id == transfer_id);

                    if acknowledged {
                        progress += chunk.len() as u64;
                        ctx.set_progress(progress);
                    }

                    offset = end;
                } else {
                    payload.insert(json_keys::TRANSFER_DATA.to_string(), Value::Null);
                    let _ = network.send(address, payload);
                    break;
                }
            }

            progress
        })
    }

    /// Generate a new sequence id
    pub fn new_sequence_id(&self) -> String {
        let mut bytes = [0u8; SEQUENCE_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);

        BASE64.encode(bytes)
    }

    /// The default reply timeout
    pub fn default_timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }
}
