use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{HashSet, VecDeque},
    fmt::{self, Display, Formatter},
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Mutex,
};

use crate::{
    key::{Distance, Key},
    K_PARAM, N_BUCKETS,
};

/// A peer's identity: its id and the endpoint it was observed at.
///
/// Equality and hashing go by id alone; the address is how we reach the
/// peer, not part of who it is.
#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Key,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: Key, addr: SocketAddr) -> Contact {
        Contact { id, addr }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.id == other.id
    }
}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Default for Contact {
    fn default() -> Contact {
        Contact {
            id: Key::default(),
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }
}

impl Display for Contact {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// A contact paired with its distance to some target, ordered closest
/// first with the id breaking ties.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ContactAndDistance(pub Contact, pub Distance);

impl PartialOrd for ContactAndDistance {
    fn partial_cmp(&self, other: &ContactAndDistance) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContactAndDistance {
    fn cmp(&self, other: &ContactAndDistance) -> Ordering {
        self.1.cmp(&other.1).then_with(|| self.0.id.cmp(&other.0.id))
    }
}

/// Distance-sorted accumulator used as scratch state by the iterative
/// lookups. Duplicates may be appended freely; `take_first` drops them.
#[derive(Default, Debug)]
pub(crate) struct CandidateSet {
    contacts: Vec<ContactAndDistance>,
}

impl CandidateSet {
    pub fn new() -> CandidateSet {
        CandidateSet::default()
    }

    pub fn push(&mut self, candidate: ContactAndDistance) {
        self.contacts.push(candidate);
    }

    pub fn append(&mut self, candidates: Vec<ContactAndDistance>) {
        self.contacts.extend(candidates);
    }

    pub fn sort(&mut self) {
        self.contacts.sort();
    }

    /// First `n` distinct contacts in current order, deduplicated by id.
    pub fn take_first(&self, n: usize) -> Vec<ContactAndDistance> {
        let mut seen = HashSet::new();
        self.contacts
            .iter()
            .filter(|candidate| seen.insert(candidate.0.id))
            .take(n)
            .cloned()
            .collect()
    }
}

/// LRU-ordered list of at most [K_PARAM] contacts, head first.
#[derive(Default, Debug)]
struct Bucket {
    entries: VecDeque<Contact>,
}

impl Bucket {
    /// Moves the contact with `id` to the head. Returns false if absent.
    fn move_to_head(&mut self, id: &Key) -> bool {
        match self.entries.iter().position(|c| &c.id == id) {
            Some(i) => {
                if let Some(entry) = self.entries.remove(i) {
                    self.entries.push_front(entry);
                }
                true
            }
            None => false,
        }
    }

    fn push_head(&mut self, contact: Contact) {
        self.entries.push_front(contact);
    }

    fn remove(&mut self, id: &Key) {
        self.entries.retain(|c| &c.id != id);
    }

    fn tail(&self) -> Option<&Contact> {
        self.entries.back()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 160-bucket XOR-metric routing table.
///
/// Bucket `i` holds contacts whose ids share `i` leading bits with the
/// owner's id. The owner's own contact is never stored.
#[derive(Debug)]
pub(crate) struct RoutingTable {
    local: Contact,
    buckets: Vec<Mutex<Bucket>>,
}

impl RoutingTable {
    pub fn new(local: Contact) -> RoutingTable {
        let mut buckets = Vec::with_capacity(N_BUCKETS);
        for _ in 0..N_BUCKETS {
            buckets.push(Mutex::new(Bucket::default()));
        }
        RoutingTable { local, buckets }
    }

    fn bucket_index(&self, id: &Key) -> Option<usize> {
        match self.local.id.distance(id).leading_zeros() {
            index if index >= N_BUCKETS => None,
            index => Some(index),
        }
    }

    /// Records an observed contact under the bucket insertion policy.
    ///
    /// A full bucket probes its least-recently-seen contact with the
    /// injected liveness check: a live tail keeps its place (moved to the
    /// head) and the newcomer is discarded; a dead tail is evicted in the
    /// newcomer's favor. The bucket lock is released while the probe is in
    /// flight and the outcome is re-validated afterwards.
    pub async fn add_contact<F, Fut>(&self, contact: Contact, probe: F)
    where
        F: FnOnce(Contact) -> Fut,
        Fut: Future<Output = bool>,
    {
        let Some(index) = self.bucket_index(&contact.id) else {
            return;
        };

        let tail = {
            let mut bucket = self.buckets[index].lock().unwrap();
            if bucket.move_to_head(&contact.id) {
                return;
            }
            if bucket.len() < K_PARAM {
                bucket.push_head(contact);
                return;
            }
            match bucket.tail() {
                Some(tail) => tail.clone(),
                None => return,
            }
        };

        if probe(tail.clone()).await {
            let mut bucket = self.buckets[index].lock().unwrap();
            bucket.move_to_head(&tail.id);
        } else {
            let mut bucket = self.buckets[index].lock().unwrap();
            bucket.remove(&tail.id);
            if !bucket.move_to_head(&contact.id) && bucket.len() < K_PARAM {
                bucket.push_head(contact);
            }
        }
    }

    /// The `n` contacts closest to `target`, sorted closest first.
    pub fn closest_contacts(&self, target: &Key, n: usize) -> Vec<ContactAndDistance> {
        self.closest_contacts_excluding(target, n, None)
    }

    /// As [closest_contacts](Self::closest_contacts), omitting `exclude`.
    /// Used so FIND responses do not echo the requester back to itself.
    pub fn closest_contacts_excluding(
        &self,
        target: &Key,
        n: usize,
        exclude: Option<&Key>,
    ) -> Vec<ContactAndDistance> {
        if n == 0 {
            return Vec::new();
        }

        let start = self.bucket_index(target).unwrap_or(N_BUCKETS - 1);

        let collect = |closest: &mut Vec<ContactAndDistance>, index: usize| {
            closest.extend(
                self.buckets[index]
                    .lock()
                    .unwrap()
                    .entries
                    .iter()
                    .filter(|c| exclude != Some(&c.id))
                    .map(|c| ContactAndDistance(c.clone(), c.id.distance(target))),
            );
        };

        let mut closest: Vec<ContactAndDistance> = Vec::with_capacity(n);
        collect(&mut closest, start);

        let mut delta = 0;
        while closest.len() < n {
            delta += 1;

            let (left, left_overflow) = start.overflowing_sub(delta);
            let right = start + delta;

            if left_overflow && right >= N_BUCKETS {
                break;
            }
            if !left_overflow {
                collect(&mut closest, left);
            }
            if right < N_BUCKETS {
                collect(&mut closest, right);
            }
        }

        closest.sort();
        closest.truncate(n);
        closest
    }

    /// Bucket-by-bucket listing for the `show` command.
    pub fn dump(&self) -> String {
        let mut out = String::from("Routing table:\n");
        for (index, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.lock().unwrap();
            if bucket.len() == 0 {
                continue;
            }
            out.push_str(&format!("bucket {index}:\n"));
            for contact in bucket.entries.iter() {
                out.push_str(&format!("  {contact}\n"));
            }
        }
        out
    }

    #[cfg(test)]
    fn bucket_ids(&self, index: usize) -> Vec<Key> {
        self.buckets[index]
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|c| c.id)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use const_hex::FromHex;

    fn contact(hex: &str, port: u16) -> Contact {
        Contact::new(Key::from_hex(hex).unwrap(), addr(port))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn table() -> RoutingTable {
        RoutingTable::new(Contact::new(Key::default(), addr(8000)))
    }

    /// 20 distinct ids landing in bucket 0 of a zero-id table.
    fn bucket_zero_ids() -> Vec<Contact> {
        (0u8..K_PARAM as u8)
            .map(|i| {
                let mut hex = format!("{:02x}", 0x80 + i);
                hex.push_str(&"00".repeat(19));
                contact(&hex, 8000 + i as u16)
            })
            .collect()
    }

    async fn live(_: Contact) -> bool {
        true
    }

    async fn dead(_: Contact) -> bool {
        false
    }

    #[tokio::test]
    async fn reobserved_contact_moves_to_head() {
        let table = table();
        let a = contact("8000000000000000000000000000000000000000", 1);
        let b = contact("8100000000000000000000000000000000000000", 2);
        let c = contact("8200000000000000000000000000000000000000", 3);

        table.add_contact(a.clone(), live).await;
        table.add_contact(b.clone(), live).await;
        table.add_contact(c.clone(), live).await;
        table.add_contact(a.clone(), live).await;

        assert_eq!(table.bucket_ids(0), vec![a.id, c.id, b.id]);
    }

    #[tokio::test]
    async fn full_bucket_keeps_live_tail_and_discards_newcomer() {
        let table = table();
        let contacts = bucket_zero_ids();
        for c in &contacts {
            table.add_contact(c.clone(), live).await;
        }
        let tail = contacts[0].clone();
        let fresh = contact("a000000000000000000000000000000000000000", 9000);

        table.add_contact(fresh.clone(), live).await;

        let ids = table.bucket_ids(0);
        assert_eq!(ids.len(), K_PARAM);
        assert_eq!(ids[0], tail.id);
        assert!(!ids.contains(&fresh.id));
    }

    #[tokio::test]
    async fn full_bucket_evicts_dead_tail() {
        let table = table();
        let contacts = bucket_zero_ids();
        for c in &contacts {
            table.add_contact(c.clone(), live).await;
        }
        let tail = contacts[0].clone();
        let fresh = contact("a000000000000000000000000000000000000000", 9000);

        table.add_contact(fresh.clone(), dead).await;

        let ids = table.bucket_ids(0);
        assert_eq!(ids.len(), K_PARAM);
        assert_eq!(ids[0], fresh.id);
        assert!(!ids.contains(&tail.id));
    }

    #[tokio::test]
    async fn own_contact_is_never_inserted() {
        let table = table();
        table
            .add_contact(Contact::new(Key::default(), addr(8001)), live)
            .await;

        for index in 0..N_BUCKETS {
            assert!(table.bucket_ids(index).is_empty());
        }
    }

    #[tokio::test]
    async fn contacts_land_in_the_prefix_bucket() {
        let table = table();
        for _ in 0..32 {
            table
                .add_contact(Contact::new(Key::random(), addr(8001)), live)
                .await;
        }

        for index in 0..N_BUCKETS {
            for id in table.bucket_ids(index) {
                assert_eq!(Key::default().distance(&id).leading_zeros(), index);
            }
        }
    }

    #[tokio::test]
    async fn closest_contacts_sorted_and_bounded() {
        let table = table();
        let target = Key::from_hex("ffffffff00000000000000000000000000000000").unwrap();
        for c in [
            contact("1fffffff00000000000000000000000000000000", 1),
            contact("2fffffff00000000000000000000000000000000", 2),
            contact("3fffffff00000000000000000000000000000000", 3),
        ] {
            table.add_contact(c, live).await;
        }

        let closest = table.closest_contacts(&target, 2);

        assert_eq!(closest.len(), 2);
        assert_eq!(
            format!("{:?}", closest[0].1),
            "c000000000000000000000000000000000000000"
        );
        assert_eq!(
            format!("{:?}", closest[1].1),
            "d000000000000000000000000000000000000000"
        );
        assert!(closest[0].1 < closest[1].1);
    }

    #[tokio::test]
    async fn closest_contacts_walks_all_buckets_when_needed() {
        let table = table();
        let mut inserted = Vec::new();
        for _ in 0..8 {
            let c = Contact::new(Key::random(), addr(8001));
            inserted.push(c.id);
            table.add_contact(c, live).await;
        }

        let closest = table.closest_contacts(&Key::random(), K_PARAM);
        assert_eq!(closest.len(), inserted.len());
    }

    #[tokio::test]
    async fn excluded_requester_is_omitted() {
        let table = table();
        let excluded = contact("2fffffff00000000000000000000000000000000", 2);
        table
            .add_contact(contact("1fffffff00000000000000000000000000000000", 1), live)
            .await;
        table.add_contact(excluded.clone(), live).await;

        let closest =
            table.closest_contacts_excluding(&Key::random(), K_PARAM, Some(&excluded.id));

        assert_eq!(closest.len(), 1);
        assert_ne!(closest[0].0.id, excluded.id);
    }

    #[test]
    fn candidate_set_dedups_at_take_time() {
        let target = Key::default();
        let a = contact("8000000000000000000000000000000000000000", 1);
        let b = contact("0100000000000000000000000000000000000000", 2);

        let mut candidates = CandidateSet::new();
        candidates.push(ContactAndDistance(a.clone(), a.id.distance(&target)));
        candidates.push(ContactAndDistance(b.clone(), b.id.distance(&target)));
        candidates.push(ContactAndDistance(a.clone(), a.id.distance(&target)));
        candidates.sort();

        let first = candidates.take_first(K_PARAM);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].0.id, b.id);
        assert_eq!(first[1].0.id, a.id);

        assert_eq!(candidates.take_first(1).len(), 1);
    }
}
