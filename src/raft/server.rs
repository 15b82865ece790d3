use super::message::ConnectionType;
use super::snapshot;
use super::{
    Apply, Envelope, Index, Log, Member, Message, Node, Options, Request, RequestId, Response,
    ServerId,
};
use crate::encoding::bincode;
use crate::errdata;
use crate::error::{Error, Result};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use crossbeam::select;
use log::{debug, error, info, warn};
use rand::Rng as _;
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long a client request may wait on the engine before timing out.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer reconnect backoff bounds. The delay doubles per failed attempt, with
/// jitter, up to the cap.
const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(3);

/// The outbound queue size per peer. The engine retries from persistent
/// state, so messages are simply dropped when a slow connection fills it.
const PEER_QUEUE: usize = 1024;

/// A local call into the event loop.
enum Call {
    Request(Request, Sender<Result<Response>>),
    Shutdown,
}

/// An instruction to the outbound routing thread.
enum Route {
    /// The peer address book changed.
    Addresses(Vec<Member>),
    /// Send a message to a peer.
    Send(Envelope),
}

/// This server's identity, answered locally without entering the engine.
#[derive(Clone)]
struct ServerInfo {
    id: ServerId,
    addresses: String,
}

/// A Raft server: drives the engine from an event loop thread, speaks the
/// peer and client protocols over TCP, and delivers committed entries to the
/// host's subscriber on a dedicated worker.
///
/// The engine never blocks on the network or the host: inbound messages and
/// requests are funneled through channels into the event loop, outbound
/// messages are queued to per-peer sender threads, and commit notifications
/// are queued to the delivery worker.
pub struct Server {
    id: ServerId,
    addresses: String,
    node: Node,
    node_rx: Receiver<Envelope>,
    apply_rx: Receiver<Apply>,
    call_tx: Sender<Call>,
    call_rx: Receiver<Call>,
    snapshots: Arc<Mutex<Box<dyn snapshot::Store>>>,
    tick_interval: Duration,
    max_clients: usize,
}

impl Server {
    /// Creates a new server. The engine recovers from the given log and
    /// snapshot store.
    pub fn new(
        id: ServerId,
        addresses: String,
        log: Log,
        snapshots: Arc<Mutex<Box<dyn snapshot::Store>>>,
        opts: Options,
        max_clients: usize,
    ) -> Result<Self> {
        let (node_tx, node_rx) = unbounded();
        let (apply_tx, apply_rx) = unbounded();
        let (call_tx, call_rx) = unbounded();
        let tick_interval = Duration::from_millis(opts.tick_millis);
        let node = Node::new(id, log, snapshots.clone(), node_tx, apply_tx, opts)?;
        Ok(Self {
            id,
            addresses,
            node,
            node_rx,
            apply_rx,
            call_tx,
            call_rx,
            snapshots,
            tick_interval,
            max_clients,
        })
    }

    /// Returns a handle exposing the host entry points. Handles remain valid
    /// across serve(); after shutdown all calls fail with Error::Shutdown.
    pub fn handle(&self) -> Raft {
        Raft {
            tx: self.call_tx.clone(),
            snapshots: self.snapshots.clone(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    /// Serves the given listeners, delivering commit notifications to the
    /// subscriber in order. Blocks until shutdown.
    pub fn serve(
        self,
        listeners: Vec<TcpListener>,
        mut subscriber: Box<dyn FnMut(Apply) + Send>,
    ) -> Result<()> {
        info!("Server {} listening on {}", self.id, self.addresses);

        let (peer_in_tx, peer_in_rx) = unbounded::<Envelope>();
        let (route_tx, route_rx) = unbounded::<Route>();

        // Accept inbound peer and client connections.
        let clients = Arc::new(AtomicUsize::new(0));
        for listener in listeners {
            let peer_in_tx = peer_in_tx.clone();
            let call_tx = self.call_tx.clone();
            let info = ServerInfo { id: self.id, addresses: self.addresses.clone() };
            let clients = clients.clone();
            let max_clients = self.max_clients;
            std::thread::spawn(move || {
                Self::accept(listener, peer_in_tx, call_tx, info, clients, max_clients)
            });
        }

        // Route outbound messages to per-peer sender sessions.
        std::thread::spawn(move || Self::route(route_rx));

        // Deliver commit notifications to the host off the engine's path.
        let apply_rx = self.apply_rx.clone();
        std::thread::spawn(move || {
            for apply in apply_rx {
                subscriber(apply);
            }
        });

        self.eventloop(peer_in_rx, route_tx)
    }

    /// Runs the engine event loop: ticks, inbound messages, and host calls.
    fn eventloop(self, peer_in_rx: Receiver<Envelope>, route_tx: Sender<Route>) -> Result<()> {
        let Server { mut node, node_rx, call_rx, tick_interval, .. } = self;
        let ticker = crossbeam::channel::tick(tick_interval);
        let mut pending: HashMap<RequestId, Sender<Result<Response>>> = HashMap::new();
        let mut peers: Vec<Member> = node.peer_addresses();
        route_tx.send(Route::Addresses(peers.clone()))?;

        'serve: loop {
            select! {
                recv(ticker) -> _ => node = node.tick()?,

                recv(peer_in_rx) -> envelope => {
                    let envelope = envelope?;
                    if envelope.to != node.id() {
                        warn!("Received message for server {}, dropping", envelope.to);
                    } else {
                        node = node.step(envelope)?;
                    }
                },

                recv(call_rx) -> call => match call? {
                    Call::Request(request, reply_tx) => {
                        let id = uuid::Uuid::new_v4().as_bytes().to_vec();
                        pending.insert(id.clone(), reply_tx);
                        let envelope = Envelope {
                            from: node.id(),
                            to: node.id(),
                            term: node.term(),
                            message: Message::ClientRequest { id, request },
                        };
                        node = node.step(envelope)?;
                    }
                    Call::Shutdown => break 'serve,
                },
            }

            // Keep the transport's address book in sync with the engine's
            // view of the membership, before routing anything sent to the
            // peers it may have just learned about.
            let addresses = node.peer_addresses();
            if addresses != peers {
                peers = addresses;
                route_tx.send(Route::Addresses(peers.clone()))?;
            }

            // Forward outbound messages, and complete client requests.
            while let Ok(envelope) = node_rx.try_recv() {
                if envelope.to == node.id() {
                    match envelope.message {
                        Message::ClientResponse { id, response } => {
                            if let Some(reply_tx) = pending.remove(&id) {
                                // The caller may have timed out and left.
                                if reply_tx.send(response).is_err() {
                                    debug!("Client request abandoned before response");
                                }
                            }
                        }
                        message => warn!("Unexpected local message {message:?}"),
                    }
                } else {
                    route_tx.send(Route::Send(envelope))?;
                }
            }
        }

        // Shut down: fail all pending and queued requests.
        info!("Server {} shutting down", node.id());
        for (_, reply_tx) in pending.drain() {
            if reply_tx.send(Err(Error::Shutdown)).is_err() {
                debug!("Client request abandoned before shutdown response");
            }
        }
        while let Ok(call) = call_rx.try_recv() {
            if let Call::Request(_, reply_tx) = call {
                if reply_tx.send(Err(Error::Shutdown)).is_err() {
                    debug!("Client request abandoned before shutdown response");
                }
            }
        }
        Ok(())
    }

    /// Accepts inbound connections on a listener, spawning a handler thread
    /// per connection.
    fn accept(
        listener: TcpListener,
        peer_in_tx: Sender<Envelope>,
        call_tx: Sender<Call>,
        info: ServerInfo,
        clients: Arc<AtomicUsize>,
        max_clients: usize,
    ) {
        loop {
            let (stream, addr) = match listener.accept() {
                Ok(conn) => conn,
                Err(err) => {
                    error!("Accept failed: {err}");
                    return;
                }
            };
            let peer_in_tx = peer_in_tx.clone();
            let call_tx = call_tx.clone();
            let info = info.clone();
            let clients = clients.clone();
            std::thread::spawn(move || {
                debug!("Connection from {addr}");
                let result = Self::serve_connection(
                    stream, peer_in_tx, call_tx, info, clients, max_clients,
                );
                match result {
                    Ok(()) => debug!("Connection from {addr} closed"),
                    Err(err) => debug!("Connection from {addr} failed: {err}"),
                }
            });
        }
    }

    /// Serves a single inbound connection, dispatching on its announced
    /// protocol.
    fn serve_connection(
        stream: TcpStream,
        peer_in_tx: Sender<Envelope>,
        call_tx: Sender<Call>,
        info: ServerInfo,
        clients: Arc<AtomicUsize>,
        max_clients: usize,
    ) -> Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);
        match bincode::deserialize_from::<_, ConnectionType>(&mut reader)? {
            ConnectionType::Peer => Self::receive_peer(reader, peer_in_tx),
            ConnectionType::Client => {
                if clients.fetch_add(1, Ordering::SeqCst) >= max_clients {
                    clients.fetch_sub(1, Ordering::SeqCst);
                    return errdata!("client connection limit reached");
                }
                let result = Self::serve_client(reader, stream, call_tx, info);
                clients.fetch_sub(1, Ordering::SeqCst);
                result
            }
        }
    }

    /// Receives envelopes from a peer connection and funnels them to the
    /// event loop.
    fn receive_peer(
        mut reader: BufReader<TcpStream>,
        peer_in_tx: Sender<Envelope>,
    ) -> Result<()> {
        while let Some(envelope) = bincode::maybe_deserialize_from::<_, Envelope>(&mut reader)? {
            peer_in_tx.send(envelope)?;
        }
        Ok(())
    }

    /// Serves a client connection: sequential request/response.
    fn serve_client(
        mut reader: BufReader<TcpStream>,
        stream: TcpStream,
        call_tx: Sender<Call>,
        info: ServerInfo,
    ) -> Result<()> {
        let mut writer = BufWriter::new(stream);
        while let Some(request) = bincode::maybe_deserialize_from::<_, Request>(&mut reader)? {
            let response = Self::process_client(request, &call_tx, &info);
            bincode::serialize_into(&mut writer, &response)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Processes a single client request. Identity requests are answered
    /// here; everything else goes through the engine.
    fn process_client(
        request: Request,
        call_tx: &Sender<Call>,
        info: &ServerInfo,
    ) -> Result<Response> {
        match request {
            Request::GetServerInfo => {
                Ok(Response::ServerInfo { id: info.id, addresses: info.addresses.clone() })
            }

            // Lets clients detect reconnections to a different server.
            Request::VerifyRecipient { id } => {
                let ok = id.map(|id| id == info.id).unwrap_or(true);
                let error = id.filter(|_| !ok).map(|id| {
                    format!("request intended for server {id}, but this is server {}", info.id)
                });
                Ok(Response::VerifyRecipient { id: info.id, ok, error })
            }

            request => {
                let (reply_tx, reply_rx) = bounded(1);
                call_tx
                    .send(Call::Request(request, reply_tx))
                    .map_err(|_| Error::Shutdown)?;
                reply_rx.recv_timeout(REQUEST_TIMEOUT)?
            }
        }
    }

    /// Routes outbound messages to per-peer sender sessions, spawning and
    /// retiring sessions as the address book changes.
    fn route(route_rx: Receiver<Route>) {
        let mut addresses: HashMap<ServerId, String> = HashMap::new();
        let mut sessions: HashMap<ServerId, Sender<Envelope>> = HashMap::new();

        for route in route_rx {
            match route {
                Route::Addresses(members) => {
                    for member in members {
                        if addresses.get(&member.id) != Some(&member.addresses) {
                            debug!("Peer {} is now at {}", member.id, member.addresses);
                            addresses.insert(member.id, member.addresses);
                            // Dropping the sender ends the old session.
                            sessions.remove(&member.id);
                        }
                    }
                }

                Route::Send(envelope) => {
                    let Some(addr) = addresses.get(&envelope.to) else {
                        debug!("No address for server {}, dropping message", envelope.to);
                        continue;
                    };
                    let tx = sessions.entry(envelope.to).or_insert_with(|| {
                        let (tx, rx) = bounded(PEER_QUEUE);
                        let addr = addr.clone();
                        std::thread::spawn(move || Self::session(addr, rx));
                        tx
                    });
                    match tx.try_send(envelope) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            debug!("Peer send queue full, dropping message")
                        }
                        Err(TrySendError::Disconnected(envelope)) => {
                            // The session exited; respawn it on the next send.
                            sessions.remove(&envelope.to);
                        }
                    }
                }
            }
        }
    }

    /// Sends queued messages to one peer, reconnecting with jittered
    /// exponential backoff. The peer may list multiple endpoints; the first
    /// one that connects is used.
    fn session(addresses: String, rx: Receiver<Envelope>) {
        let mut backoff = RECONNECT_MIN;
        loop {
            let stream = addresses
                .split(',')
                .map(str::trim)
                .find_map(|addr| TcpStream::connect(addr).ok());
            match stream {
                Some(stream) => {
                    debug!("Connected to peer at {addresses}");
                    backoff = RECONNECT_MIN;
                    match Self::session_send(stream, &rx) {
                        // The server is shutting down or replaced the session.
                        Err(Error::Shutdown) => return,
                        Err(err) => debug!("Peer connection to {addresses} failed: {err}"),
                        Ok(()) => return,
                    }
                }
                None => debug!("Failed connecting to peer at {addresses}"),
            }
            // Drain the queue while disconnected: a closed channel means the
            // session was retired, and stale messages are better dropped
            // than delivered late.
            loop {
                match rx.try_recv() {
                    Ok(_) => {}
                    Err(crossbeam::channel::TryRecvError::Empty) => break,
                    Err(crossbeam::channel::TryRecvError::Disconnected) => return,
                }
            }
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            std::thread::sleep(backoff + Duration::from_millis(jitter));
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    /// Writes queued messages to a connected peer stream.
    fn session_send(stream: TcpStream, rx: &Receiver<Envelope>) -> Result<()> {
        let mut writer = BufWriter::new(stream);
        bincode::serialize_into(&mut writer, &ConnectionType::Peer)?;
        writer.flush()?;
        loop {
            let envelope = rx.recv()?;
            bincode::serialize_into(&mut writer, &envelope)?;
            if rx.is_empty() {
                writer.flush()?;
            }
        }
    }
}

/// A handle to a running server, exposing the host entry points. Cheap to
/// clone and safe to use from any thread.
#[derive(Clone)]
pub struct Raft {
    tx: Sender<Call>,
    snapshots: Arc<Mutex<Box<dyn snapshot::Store>>>,
    timeout: Duration,
}

impl Raft {
    /// Issues a request to the engine and waits for its response.
    fn call(&self, request: Request) -> Result<Response> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx.send(Call::Request(request, reply_tx)).map_err(|_| Error::Shutdown)?;
        reply_rx.recv_timeout(self.timeout)?
    }

    /// Appends an opaque payload to the replicated log, returning its index
    /// once it has committed.
    pub fn replicate(&self, payload: Vec<u8>) -> Result<Index> {
        match self.call(Request::Replicate(payload))? {
            Response::Replicate(index) => Ok(index),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// One-shot cluster initialization: writes term 1 and a configuration
    /// naming just this server.
    pub fn bootstrap(&self) -> Result<()> {
        match self.call(Request::Bootstrap)? {
            Response::Bootstrap => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Returns the latest committed simple configuration and its id.
    pub fn get_configuration(&self) -> Result<(Index, Vec<Member>)> {
        match self.call(Request::GetConfiguration)? {
            Response::Configuration { id, members } => Ok((id, members)),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Replaces the cluster membership via joint consensus.
    pub fn set_configuration(&self, old_id: Index, members: Vec<Member>) -> Result<()> {
        match self.call(Request::SetConfiguration { old_id, members })? {
            Response::SetConfiguration => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Returns the commit index, if the server is currently confident of
    /// its leadership.
    pub fn get_last_commit_index(&self) -> Result<Index> {
        match self.call(Request::GetLastCommitIndex)? {
            Response::LastCommitIndex(index) => Ok(index),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Begins a host snapshot covering entries up to the given index,
    /// returning the snapshot metadata and a writer for the host's state
    /// bytes. The host owns the writer until snapshot_done().
    pub fn begin_snapshot(
        &self,
        until: Index,
    ) -> Result<(snapshot::Meta, Box<dyn snapshot::Writer>)> {
        let meta = match self.call(Request::BeginSnapshot { until })? {
            Response::BeginSnapshot(meta) => meta,
            response => return errdata!("unexpected response {response:?}"),
        };
        let writer = self.snapshots.lock()?.writer(&meta)?;
        Ok((meta, writer))
    }

    /// Completes a host snapshot: installs the writer atomically and
    /// compacts the log prefix the snapshot covers.
    pub fn snapshot_done(
        &self,
        meta: &snapshot::Meta,
        writer: Box<dyn snapshot::Writer>,
    ) -> Result<()> {
        writer.save()?;
        match self.call(Request::CompleteSnapshot { index: meta.index })? {
            Response::CompleteSnapshot => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Shuts the server down. Subsequent calls fail with Error::Shutdown.
    pub fn shutdown(&self) -> Result<()> {
        self.tx.send(Call::Shutdown).map_err(|_| Error::Shutdown)
    }
}
