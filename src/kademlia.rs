use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use crate::key::Key;
use crate::message::{Message, MessageType};
use crate::routing::{CandidateSet, Contact, ContactAndDistance, RoutingTable};
use crate::rpc::{InitRpcError, Rpc};
use crate::store::{MemoryStore, ValueStore};
use crate::{A_PARAM, K_PARAM, REPUBLISH_INTERVAL, TIMEOUT};

/// Per-round response channel capacity.
const RESPONSE_BUFFER: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("can't start rpc service: {0}")]
    CantInitRpc(#[from] InitRpcError),
}

#[derive(Default)]
pub struct KademliaBuilder {
    address: Option<IpAddr>,
    port: u16,
    id: Option<Key>,
    bootstrap: Option<SocketAddr>,
    store: Option<Arc<dyn ValueStore>>,
    rpc_timeout: Option<Duration>,
}

impl KademliaBuilder {
    pub fn address(&mut self, address: IpAddr) -> &mut Self {
        self.address = Some(address);
        self
    }

    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    pub fn id(&mut self, id: Key) -> &mut Self {
        self.id = Some(id);
        self
    }

    /// Peer to join the network through on startup.
    pub fn bootstrap(&mut self, addr: SocketAddr) -> &mut Self {
        self.bootstrap = Some(addr);
        self
    }

    pub fn store(&mut self, store: Arc<dyn ValueStore>) -> &mut Self {
        self.store = Some(store);
        self
    }

    pub fn rpc_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    /// Binds the datagram endpoint, starts the dispatcher and, when a
    /// bootstrap peer is configured, joins the network through it.
    pub async fn start(&mut self) -> Result<KademliaNode, StartError> {
        let address = self
            .address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let id = self.id.unwrap_or_else(Key::random);
        let timeout = self.rpc_timeout.unwrap_or(TIMEOUT);

        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let rpc = Rpc::bind(SocketAddr::new(address, self.port), id, inbound_tx, timeout).await?;
        let local = rpc.local_contact().clone();

        info!("new node created {local}");

        let node = KademliaNode {
            routes: Arc::new(RoutingTable::new(local.clone())),
            store: self
                .store
                .clone()
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            rpc,
            local,
            republished: Arc::new(Mutex::new(HashSet::new())),
        };

        node.clone().start_dispatcher(inbound_rx);

        if let Some(bootstrap) = self.bootstrap {
            node.join(bootstrap).await;
        }

        Ok(node)
    }
}

/// A running DHT node. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct KademliaNode {
    routes: Arc<RoutingTable>,
    store: Arc<dyn ValueStore>,
    rpc: Arc<Rpc>,
    local: Contact,
    republished: Arc<Mutex<HashSet<Key>>>,
}

impl KademliaNode {
    pub fn builder() -> KademliaBuilder {
        KademliaBuilder::default()
    }

    /// The node's id.
    pub fn id(&self) -> Key {
        self.local.id
    }

    /// The node's bound datagram endpoint.
    pub fn address(&self) -> SocketAddr {
        self.local.addr
    }

    fn start_dispatcher(self, mut inbound: mpsc::Receiver<Message>) {
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                let node = self.clone();
                tokio::spawn(async move { node.dispatch(msg).await });
            }
            debug!("inbound channel closed, dispatcher stopping");
        });
    }

    /// Routes one inbound message: requests are answered, responses go to
    /// the request waiting on them, anything else is dropped. The sender
    /// is recorded afterwards whatever the type was: the datagram already
    /// proved it alive.
    async fn dispatch(&self, msg: Message) {
        let sender = msg.sender.clone();
        match msg.msg_type {
            MessageType::Ping
            | MessageType::FindNode
            | MessageType::FindValue
            | MessageType::Store => {
                if let Some(reply) = self.handle_request(&msg) {
                    if let Err(err) = self.rpc.respond(sender.addr, reply).await {
                        error!("reply send error: {err}");
                    }
                }
            }
            MessageType::Pong
            | MessageType::FindNodeResponse
            | MessageType::FindValueResponse
            | MessageType::StoreResponse => self.rpc.deliver_response(msg),
            MessageType::Timeout | MessageType::Unknown => {
                debug!("dropping {:?} message from {sender}", msg.msg_type);
            }
        }
        self.record_contact(sender).await;
    }

    fn handle_request(&self, req: &Message) -> Option<Message> {
        match req.msg_type {
            MessageType::Ping => {
                let mut reply = Message::new(MessageType::Pong);
                reply.rpc_id = req.rpc_id;
                Some(reply)
            }
            MessageType::FindNode => {
                let mut reply = Message::new(MessageType::FindNodeResponse);
                reply.rpc_id = req.rpc_id;
                reply.contacts = self.closest_excluding(&req.key, &req.sender.id);
                Some(reply)
            }
            MessageType::FindValue => {
                let mut reply = Message::new(MessageType::FindValueResponse);
                reply.rpc_id = req.rpc_id;
                reply.contacts = self.closest_excluding(&req.key, &req.sender.id);
                if let Some(value) = self.store.get(&req.key) {
                    reply.body = value;
                }
                Some(reply)
            }
            MessageType::Store => {
                self.store.put(&req.key, &req.body);
                let mut reply = Message::new(MessageType::StoreResponse);
                reply.rpc_id = req.rpc_id;
                reply.key = req.key;
                Some(reply)
            }
            _ => None,
        }
    }

    fn closest_excluding(&self, target: &Key, requester: &Key) -> Vec<Contact> {
        self.routes
            .closest_contacts_excluding(target, K_PARAM, Some(requester))
            .into_iter()
            .map(|candidate| candidate.0)
            .collect()
    }

    /// Feeds an observed peer into the routing table under the bucket
    /// insertion policy, with a PING probe deciding full-bucket evictions.
    pub async fn add_peer(&self, contact: Contact) {
        self.record_contact(contact).await;
    }

    async fn record_contact(&self, contact: Contact) {
        let node = self.clone();
        self.routes
            .add_contact(contact, |tail| async move { node.ping(tail.addr).await })
            .await;
    }

    /// Probes `addr` for liveness.
    #[instrument(skip(self))]
    pub async fn ping(&self, addr: SocketAddr) -> bool {
        let reply = self
            .rpc
            .send_and_await(addr, Message::new(MessageType::Ping))
            .await;
        reply.msg_type == MessageType::Pong
    }

    /// Iteratively finds the k contacts closest to `target`.
    #[instrument(skip(self))]
    pub async fn lookup_nodes(&self, target: &Key) -> Vec<ContactAndDistance> {
        let mut candidates = CandidateSet::new();
        candidates.append(self.routes.closest_contacts(target, K_PARAM));
        let mut queried = HashSet::new();
        let (responses_tx, mut responses) = mpsc::channel(RESPONSE_BUFFER);

        loop {
            candidates.sort();
            let probed =
                self.probe_round(MessageType::FindNode, target, &candidates, &mut queried, &responses_tx);
            if probed == 0 {
                return candidates.take_first(K_PARAM);
            }

            for _ in 0..probed {
                let Some(response) = responses.recv().await else {
                    return candidates.take_first(K_PARAM);
                };
                self.merge_response_contacts(target, &mut candidates, response.contacts);
            }
        }
    }

    /// Iteratively looks for the value stored under `key` in the network.
    #[instrument(skip(self))]
    pub async fn lookup_value(&self, key: &Key) -> Option<Vec<u8>> {
        let mut candidates = CandidateSet::new();
        candidates.append(self.routes.closest_contacts(key, K_PARAM));
        let mut queried = HashSet::new();
        let (responses_tx, mut responses) = mpsc::channel(RESPONSE_BUFFER);

        loop {
            candidates.sort();
            let probed =
                self.probe_round(MessageType::FindValue, key, &candidates, &mut queried, &responses_tx);
            if probed == 0 {
                return None;
            }

            for _ in 0..probed {
                let response = responses.recv().await?;
                if !response.body.is_empty() {
                    return Some(response.body);
                }
                self.merge_response_contacts(key, &mut candidates, response.contacts);
            }
        }
    }

    /// Selects up to α not-yet-queried contacts among the k closest
    /// candidates and fires one probe task per selection. Dedup is by
    /// address: an endpoint is probed at most once per lookup.
    fn probe_round(
        &self,
        msg_type: MessageType,
        target: &Key,
        candidates: &CandidateSet,
        queried: &mut HashSet<SocketAddr>,
        responses: &mpsc::Sender<Message>,
    ) -> usize {
        let mut probed = 0;
        for ContactAndDistance(contact, _) in candidates.take_first(K_PARAM) {
            if probed == A_PARAM {
                break;
            }
            if !queried.insert(contact.addr) {
                continue;
            }

            let node = self.clone();
            let responses = responses.clone();
            let target = *target;
            tokio::spawn(async move {
                let mut request = Message::new(msg_type);
                request.key = target;
                let response = node.rpc.send_and_await(contact.addr, request).await;
                _ = responses.send(response).await;
            });

            probed += 1;
        }
        probed
    }

    /// Folds contacts from a round response into the candidate set and,
    /// off the lookup's critical path, into the routing table. A timeout
    /// response carries no contacts and falls through.
    fn merge_response_contacts(
        &self,
        target: &Key,
        candidates: &mut CandidateSet,
        contacts: Vec<Contact>,
    ) {
        for contact in contacts {
            let node = self.clone();
            let observed = contact.clone();
            tokio::spawn(async move { node.record_contact(observed).await });

            let distance = contact.id.distance(target);
            candidates.push(ContactAndDistance(contact, distance));
        }
    }

    /// Joins the network: pings the bootstrap peer until it answers, then
    /// looks up the own id so nearby peers populate the routing table.
    #[instrument(skip(self))]
    pub async fn join(&self, bootstrap: SocketAddr) {
        info!("joining network via {bootstrap}");
        while !self.ping(bootstrap).await {
            warn!("timed out joining network, retrying");
        }

        let own_id = self.local.id;
        self.lookup_nodes(&own_id).await;
        debug!("routing table after joining:\n{}", self.routes.dump());
    }

    /// Stores `data` in the network and returns its key.
    ///
    /// The k peers closest to the key receive a STORE; in a network with
    /// fewer than k known peers the value is also kept locally. The first
    /// store of a key schedules its periodic republication, one live
    /// timer per stored blob.
    #[instrument(skip_all)]
    pub async fn store(&self, data: &[u8]) -> Key {
        let key = Key::hash(data);
        debug!("storing value under {key}");

        self.publish(&key, data).await;

        let first = self.republished.lock().unwrap().insert(key);
        if first {
            let node = self.clone();
            let data = data.to_vec();
            tokio::spawn(async move {
                loop {
                    time::sleep(REPUBLISH_INTERVAL).await;
                    debug!("republishing {key}");
                    node.publish(&key, &data).await;
                }
            });
        }

        key
    }

    async fn publish(&self, key: &Key, data: &[u8]) {
        let closest = self.lookup_nodes(key).await;

        if closest.len() < K_PARAM {
            self.store.put(key, data);
        }

        for ContactAndDistance(contact, _) in closest {
            let mut request = Message::new(MessageType::Store);
            request.key = *key;
            request.body = data.to_vec();
            if let Err(err) = self.rpc.send(contact.addr, request).await {
                warn!("can't send store request to {contact}: {err}");
            }
        }
    }

    /// Returns the value stored under `key`, looking it up in the network
    /// when it is not held locally.
    pub async fn lookup_data(&self, key: &Key) -> Option<Vec<u8>> {
        if let Some(value) = self.store.get(key) {
            return Some(value);
        }
        self.lookup_value(key).await
    }

    /// Bucket-by-bucket routing table listing for the `show` command.
    pub fn dump_routes(&self) -> String {
        self.routes.dump()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rpc::MockMessenger;

    fn test_node(mock: Arc<MockMessenger>) -> KademliaNode {
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let rpc = Rpc::with_messenger(
            Key::random(),
            1234,
            mock,
            inbound_tx,
            Duration::from_millis(100),
        );
        let local = rpc.local_contact().clone();
        KademliaNode {
            routes: Arc::new(RoutingTable::new(local.clone())),
            store: Arc::new(MemoryStore::new()),
            rpc,
            local,
            republished: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn peer(port: u16) -> Contact {
        Contact::new(
            Key::random(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        )
    }

    fn request(msg_type: MessageType, sender: &Contact) -> Message {
        let mut msg = Message::new(msg_type);
        msg.rpc_id = Key::random();
        msg.sender = sender.clone();
        msg
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let mock = MockMessenger::new();
        let node = test_node(mock.clone());
        let sender = peer(7001);

        let req = request(MessageType::Ping, &sender);
        node.dispatch(req.clone()).await;

        let (to, reply) = mock.last().unwrap();
        assert_eq!(to, sender.addr);
        assert_eq!(reply.msg_type, MessageType::Pong);
        assert_eq!(reply.rpc_id, req.rpc_id);
    }

    #[tokio::test]
    async fn every_inbound_message_records_the_sender() {
        let mock = MockMessenger::new();
        let node = test_node(mock);
        let sender = peer(7002);

        node.dispatch(request(MessageType::Unknown, &sender)).await;

        assert!(node.dump_routes().contains(&format!("{}", sender.id)));
    }

    #[tokio::test]
    async fn find_node_reply_excludes_the_requester() {
        let mock = MockMessenger::new();
        let node = test_node(mock.clone());
        let requester = peer(7003);
        let other = peer(7004);
        node.add_peer(requester.clone()).await;
        node.add_peer(other.clone()).await;

        let mut req = request(MessageType::FindNode, &requester);
        req.key = Key::random();
        node.dispatch(req).await;

        let (_, reply) = mock.last().unwrap();
        assert_eq!(reply.msg_type, MessageType::FindNodeResponse);
        assert!(reply.contacts.iter().any(|c| c.id == other.id));
        assert!(!reply.contacts.iter().any(|c| c.id == requester.id));
    }

    #[tokio::test]
    async fn find_value_returns_body_when_stored() {
        let mock = MockMessenger::new();
        let node = test_node(mock.clone());
        let sender = peer(7005);
        let key = Key::hash(b"payload");

        let mut req = request(MessageType::FindValue, &sender);
        req.key = key;
        node.dispatch(req.clone()).await;
        let (_, reply) = mock.last().unwrap();
        assert_eq!(reply.msg_type, MessageType::FindValueResponse);
        assert!(reply.body.is_empty());

        node.store.put(&key, b"payload");
        node.dispatch(req).await;
        let (_, reply) = mock.last().unwrap();
        assert_eq!(reply.body, b"payload".to_vec());
    }

    #[tokio::test]
    async fn store_request_writes_and_acknowledges() {
        let mock = MockMessenger::new();
        let node = test_node(mock.clone());
        let sender = peer(7006);
        let key = Key::hash(b"blob");

        let mut req = request(MessageType::Store, &sender);
        req.key = key;
        req.body = b"blob".to_vec();
        node.dispatch(req.clone()).await;

        assert_eq!(node.store.get(&key), Some(b"blob".to_vec()));
        let (_, reply) = mock.last().unwrap();
        assert_eq!(reply.msg_type, MessageType::StoreResponse);
        assert_eq!(reply.rpc_id, req.rpc_id);
    }

    #[tokio::test]
    async fn store_then_lookup_data_on_a_lone_node() {
        let mock = MockMessenger::new();
        let node = test_node(mock);

        let key = node.store(b"hello").await;

        assert_eq!(
            format!("{key}"),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(node.lookup_data(&key).await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn repeated_store_keeps_one_republish_timer() {
        let mock = MockMessenger::new();
        let node = test_node(mock);

        node.store(b"hello").await;
        node.store(b"hello").await;

        assert_eq!(node.republished.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lookup_terminates_with_fewer_than_alpha_peers() {
        let mock = MockMessenger::new();
        let node = test_node(mock);
        let near = peer(7007);
        let far = peer(7008);
        node.add_peer(near.clone()).await;
        node.add_peer(far.clone()).await;

        // Nothing ever answers the mock transport, so both probes time
        // out and the second round has nobody left to query.
        let found = node.lookup_nodes(&Key::random()).await;

        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|c| c.0.id == near.id));
        assert!(found.iter().any(|c| c.0.id == far.id));
    }

    #[tokio::test]
    async fn lookup_value_not_found_on_unresponsive_network() {
        let mock = MockMessenger::new();
        let node = test_node(mock);
        node.add_peer(peer(7009)).await;

        assert_eq!(node.lookup_value(&Key::random()).await, None);
    }
}
