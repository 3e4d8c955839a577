//! Command dispatcher: multiplexes logical application inquiries over a single
//! [Link], matching replies to outstanding requests and routing unsolicited
//! notifications to subscribers.
//!
//! Requests and their replies/rejects are represented as a tagged
//! [packet::Packet] rather than an untyped blob, so a reply, a reject, and a
//! push notification for the same key are distinguishable without guessing
//! from shape alone.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    codec,
    error::{Error, ErrorKind},
    link::Link,
};

/// Default timeout for an outstanding application request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A (opcode, inquired-type) pair identifying a logical inquiry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Key {
    /// Wire opcode.
    pub opcode: u8,
    /// Inquired function type.
    pub inquiry_type: u8,
}

impl Key {
    /// Creates a new correlation key.
    pub const fn new(opcode: u8, inquiry_type: u8) -> Self {
        Self { opcode, inquiry_type }
    }
}

/// Application-layer packet framing carried inside a link DATA payload.
///
/// The wire frame codec (§4.1) and link ack/retry protocol (§4.2) are
/// agnostic to what's inside a DATA payload; this module defines the
/// dispatcher's own tagged packet shape layered on top: a one-byte class tag,
/// the two-byte correlation key, then the application body.
pub mod packet {
    use super::Key;

    /// Class of an application-layer packet.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum Class {
        /// A request we sent.
        Request,
        /// A successful reply to a request.
        Reply,
        /// The device rejected a request.
        Reject,
        /// An unsolicited push from the device.
        Notify,
    }

    impl Class {
        const fn to_byte(self) -> u8 {
            match self {
                Self::Request => 0x00,
                Self::Reply => 0x01,
                Self::Reject => 0x02,
                Self::Notify => 0x03,
            }
        }

        const fn from_byte(byte: u8) -> Option<Self> {
            match byte {
                0x00 => Some(Self::Request),
                0x01 => Some(Self::Reply),
                0x02 => Some(Self::Reject),
                0x03 => Some(Self::Notify),
                _ => None,
            }
        }
    }

    /// A decoded application packet.
    #[derive(Clone, Debug)]
    pub struct Packet {
        /// Packet class.
        pub class: Class,
        /// Correlation key.
        pub key: Key,
        /// Application payload.
        pub body: Vec<u8>,
    }

    fn encode(class: Class, key: Key, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + body.len());
        out.push(class.to_byte());
        out.push(key.opcode);
        out.push(key.inquiry_type);
        out.extend_from_slice(body);
        out
    }

    /// Encodes a request packet.
    pub fn encode_request(key: Key, body: &[u8]) -> Vec<u8> {
        encode(Class::Request, key, body)
    }

    /// Encodes a reply packet (used by tests simulating a peer device).
    pub fn encode_reply(key: Key, body: &[u8]) -> Vec<u8> {
        encode(Class::Reply, key, body)
    }

    /// Encodes a reject packet (used by tests simulating a peer device).
    pub fn encode_reject(key: Key, body: &[u8]) -> Vec<u8> {
        encode(Class::Reject, key, body)
    }

    /// Encodes a notify packet (used by tests simulating a peer device).
    pub fn encode_notify(key: Key, body: &[u8]) -> Vec<u8> {
        encode(Class::Notify, key, body)
    }

    /// Decodes an application packet from a link DATA payload.
    pub fn decode(payload: &[u8]) -> Option<Packet> {
        if payload.len() < 3 {
            return None;
        }
        let class = Class::from_byte(payload[0])?;
        let key = Key::new(payload[1], payload[2]);
        Some(Packet { class, key, body: payload[3..].to_vec() })
    }
}

struct QueuedCall {
    id: u64,
    body: Vec<u8>,
    tx: oneshot::Sender<Result<Vec<u8>, Error>>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<Key, std::collections::VecDeque<QueuedCall>>,
    subscribers: HashMap<Key, mpsc::UnboundedSender<Vec<u8>>>,
    next_id: u64,
}

/// The command dispatcher, shared between the session's inbound pump and
/// every capability surface that issues requests.
pub struct Dispatcher {
    link: Arc<Link>,
    inner: Mutex<Inner>,
}

impl Dispatcher {
    /// Creates a dispatcher driving requests over `link`.
    pub fn new(link: Arc<Link>) -> Self {
        Self { link, inner: Mutex::new(Inner::default()) }
    }

    /// Issues a request for `key`, queueing it behind any other request for
    /// the same key already in flight: at most one request per key is ever
    /// outstanding on the wire at a time.
    ///
    /// Resolves with the device's reply body, [ErrorKind::Reject] if the
    /// device rejected it, [ErrorKind::Timeout] after [REQUEST_TIMEOUT], or a
    /// link-layer error if the link goes down first. Returns
    /// [ErrorKind::AllocFailure] synchronously if `body` cannot be framed.
    pub async fn call(&self, key: Key, body: Vec<u8>) -> Result<Vec<u8>, Error> {
        if body.len() > codec::MAX_PAYLOAD_LEN {
            return Err(Error::new(ErrorKind::AllocFailure));
        }

        let (tx, rx) = oneshot::channel();
        let (id, should_send_now) = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_id;
            inner.next_id += 1;
            let queue = inner.queues.entry(key).or_default();
            queue.push_back(QueuedCall { id, body: body.clone(), tx });
            (id, queue.len() == 1)
        };

        if should_send_now {
            self.transmit(key, body).await;
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::new(ErrorKind::PeerGone)),
            Err(_elapsed) => {
                self.cancel(key, id).await;
                Err(Error::new(ErrorKind::Timeout))
            }
        }
    }

    /// Subscribes to unsolicited notifications for `key`.
    ///
    /// Replaces any previous subscription for the same key; the prior
    /// stream's sender is dropped, ending it.
    pub async fn subscribe(&self, key: Key) -> UnboundedReceiverStream<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().await.subscribers.insert(key, tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Fails every queued and in-flight request with [ErrorKind::PeerGone]
    /// and detaches every subscriber.
    pub async fn on_link_down(&self) {
        let mut inner = self.inner.lock().await;
        for (_, queue) in inner.queues.drain() {
            for call in queue {
                let _ = call.tx.send(Err(Error::new(ErrorKind::PeerGone)));
            }
        }
        inner.subscribers.clear();
    }

    /// Processes one link-level DATA payload, routing it to an awaiter or a
    /// subscriber.
    ///
    /// Routing is class-agnostic: a packet whose key has a pending awaiter
    /// always satisfies that awaiter first, even if a subscriber is also
    /// registered for the same key; only absent an awaiter is a `Notify`
    /// routed to its subscriber. A packet matching neither is logged and
    /// discarded.
    pub async fn handle_inbound(&self, payload: Vec<u8>) {
        let Some(pkt) = packet::decode(&payload) else {
            log::warn!("dropping application packet that failed to parse ({} bytes)", payload.len());
            return;
        };

        let satisfied_awaiter = {
            let mut inner = self.inner.lock().await;
            match inner.queues.get_mut(&pkt.key) {
                Some(queue) => match queue.pop_front() {
                    Some(call) => {
                        let result = match pkt.class {
                            packet::Class::Reject => Err(Error::new(ErrorKind::Reject)),
                            _ => Ok(pkt.body.clone()),
                        };
                        let _ = call.tx.send(result);
                        if queue.is_empty() {
                            inner.queues.remove(&pkt.key);
                        }
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };

        if satisfied_awaiter {
            let next_body = {
                let inner = self.inner.lock().await;
                inner.queues.get(&pkt.key).and_then(|q| q.front()).map(|c| c.body.clone())
            };
            if let Some(body) = next_body {
                self.transmit(pkt.key, body).await;
            }
            return;
        }

        if pkt.class == packet::Class::Notify {
            let subscriber = self.inner.lock().await.subscribers.get(&pkt.key).cloned();
            if let Some(sub) = subscriber {
                let _ = sub.send(pkt.body);
                return;
            }
        }

        log::warn!("unsolicited packet for {:?} has no awaiter or subscriber; discarding", pkt.key);
    }

    /// Transmits the request for `key`/`body`, cascading to the next queued
    /// request for the same key if the link itself fails.
    async fn transmit(&self, key: Key, mut body: Vec<u8>) {
        loop {
            let wire = packet::encode_request(key, &body);
            match self.link.send(wire).await {
                Ok(()) => return,
                Err(err) => {
                    let next_body = {
                        let mut inner = self.inner.lock().await;
                        let Some(queue) = inner.queues.get_mut(&key) else { return };
                        if let Some(call) = queue.pop_front() {
                            let _ = call.tx.send(Err(err.clone()));
                        }
                        if queue.is_empty() {
                            inner.queues.remove(&key);
                            None
                        } else {
                            queue.front().map(|c| c.body.clone())
                        }
                    };
                    match next_body {
                        Some(next) => body = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Removes a timed-out call from its queue, advancing to the next queued
    /// call if the timed-out call was the one currently in flight.
    async fn cancel(&self, key: Key, id: u64) {
        let next_body = {
            let mut inner = self.inner.lock().await;
            let Some(queue) = inner.queues.get_mut(&key) else { return };
            let Some(pos) = queue.iter().position(|c| c.id == id) else { return };
            let was_head = pos == 0;
            queue.remove(pos);
            if queue.is_empty() {
                inner.queues.remove(&key);
                None
            } else if was_head {
                queue.front().map(|c| c.body.clone())
            } else {
                None
            }
        };
        if let Some(body) = next_body {
            self.transmit(key, body).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn battery_key() -> Key {
        Key::new(0x10, 0x01)
    }

    async fn spawn_pair() -> (Arc<Dispatcher>, tokio::io::DuplexStream) {
        let (local, remote) = duplex(8192);
        let (link, inbound) = Link::spawn(local);
        let link = Arc::new(link);
        let dispatcher = Arc::new(Dispatcher::new(link));

        let d = dispatcher.clone();
        tokio::spawn(async move {
            use tokio_stream::StreamExt;
            let mut inbound = inbound;
            while let Some(payload) = inbound.next().await {
                d.handle_inbound(payload).await;
            }
        });

        (dispatcher, remote)
    }

    /// Reads one DATA frame off `remote`, replies with the given application
    /// packet, and acks the DATA frame (playing the role of the device).
    async fn respond(remote: &mut tokio::io::DuplexStream, body_for_reply: Vec<u8>) -> Key {
        let mut buf = [0u8; 4096];
        let n = remote.read(&mut buf).await.unwrap();
        let mut dec = codec::Decoder::new();
        dec.feed(&buf[..n]);
        let frame = match dec.poll() {
            codec::Poll::Frame(f) => f,
            other => panic!("expected frame, got {other:?}"),
        };
        let pkt = packet::decode(&frame.payload).unwrap();
        assert_eq!(pkt.class, packet::Class::Request);

        let ack = codec::encode(codec::FrameKind::Ack, frame.seq, &[]);
        remote.write_all(&ack).await.unwrap();

        let reply_wire = codec::encode(codec::FrameKind::DataMdr, 0, &body_for_reply);
        remote.write_all(&reply_wire).await.unwrap();
        // consume our own ack for the reply frame we just "sent"
        let mut ack_buf = [0u8; 64];
        remote.read(&mut ack_buf).await.unwrap();

        pkt.key
    }

    #[tokio::test]
    async fn call_resolves_with_reply_body() {
        let (dispatcher, mut remote) = spawn_pair().await;
        let key = battery_key();

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.call(key, vec![0x01]).await }
        });

        let reply = packet::encode_reply(key, &[0x55]);
        respond(&mut remote, reply).await;

        assert_eq!(call.await.unwrap().unwrap(), vec![0x55]);
    }

    #[tokio::test]
    async fn reject_surfaces_as_reject_error() {
        let (dispatcher, mut remote) = spawn_pair().await;
        let key = battery_key();

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.call(key, vec![0x01]).await }
        });

        let reject = packet::encode_reject(key, &[]);
        respond(&mut remote, reject).await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Reject);
    }

    #[tokio::test]
    async fn same_key_calls_complete_in_submission_order() {
        let (dispatcher, mut remote) = spawn_pair().await;
        let key = Key::new(0x20, 0x05); // playback volume

        let d1 = dispatcher.clone();
        let d2 = dispatcher.clone();
        let d3 = dispatcher.clone();
        let c1 = tokio::spawn(async move { d1.call(key, vec![1]).await });
        let c2 = tokio::spawn(async move { d2.call(key, vec![2]).await });
        let c3 = tokio::spawn(async move { d3.call(key, vec![3]).await });

        // The device must see three distinct requests, in submission order.
        for expect in [1u8, 2, 3] {
            let reply = packet::encode_reply(key, &[expect]);
            respond(&mut remote, reply).await;
        }

        assert_eq!(c1.await.unwrap().unwrap(), vec![1]);
        assert_eq!(c2.await.unwrap().unwrap(), vec![2]);
        assert_eq!(c3.await.unwrap().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn notification_without_awaiter_reaches_subscriber() {
        let (dispatcher, mut remote) = spawn_pair().await;
        let key = Key::new(0x30, 0x02); // distinct notify-family opcode

        let mut sub = dispatcher.subscribe(key).await;

        let notify = packet::encode_notify(key, &[0x09]);
        let wire = codec::encode(codec::FrameKind::DataMdr, 0, &notify);
        remote.write_all(&wire).await.unwrap();
        let mut ack_buf = [0u8; 64];
        remote.read(&mut ack_buf).await.unwrap();

        use tokio_stream::StreamExt;
        let received = sub.next().await.unwrap();
        assert_eq!(received, vec![0x09]);
    }

    #[tokio::test]
    async fn awaiter_takes_priority_over_coincident_subscriber() {
        let (dispatcher, mut remote) = spawn_pair().await;
        let key = battery_key();
        let mut sub = dispatcher.subscribe(key).await;

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.call(key, vec![0x01]).await }
        });
        let reply = packet::encode_reply(key, &[0x42]);
        respond(&mut remote, reply).await;

        assert_eq!(call.await.unwrap().unwrap(), vec![0x42]);
        use std::time::Duration;
        use tokio_stream::StreamExt;
        assert!(tokio::time::timeout(Duration::from_millis(50), sub.next()).await.is_err());
    }

    #[tokio::test]
    async fn oversized_payload_fails_synchronously_without_wire_traffic() {
        let (local, _remote) = duplex(8192);
        let (link, _inbound) = Link::spawn(local);
        let dispatcher = Dispatcher::new(Arc::new(link));

        let huge = vec![0u8; codec::MAX_PAYLOAD_LEN + 1];
        let err = dispatcher.call(Key::new(0x01, 0x01), huge).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AllocFailure);
    }

    #[tokio::test]
    async fn on_link_down_fails_queued_requests_with_peer_gone() {
        let (local, _remote) = duplex(8192);
        let (link, _inbound) = Link::spawn(local);
        let link = Arc::new(link);
        let dispatcher = Arc::new(Dispatcher::new(link));
        let key = Key::new(0x40, 0x01);

        // First call occupies the link (never acked); second queues behind it.
        let d1 = dispatcher.clone();
        let c1 = tokio::spawn(async move { d1.call(key, vec![1]).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let d2 = dispatcher.clone();
        let c2 = tokio::spawn(async move { d2.call(key, vec![2]).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        dispatcher.on_link_down().await;

        assert_eq!(c1.await.unwrap().unwrap_err().kind, ErrorKind::PeerGone);
        assert_eq!(c2.await.unwrap().unwrap_err().kind, ErrorKind::PeerGone);
    }
}
