//! Link layer: one full-duplex byte stream, one outstanding DATA frame, and the
//! ack/retransmission protocol that keeps the two sides in lockstep.
//!
//! A single poll descriptor plus a timer deadline, driven by an external
//! cooperative scheduler, is realized the idiomatic tokio way: [Link::spawn]
//! hands the stream to a dedicated task that owns it exclusively and drives
//! itself with `tokio::select!` — the same single-poll-loop shape, just
//! expressed as a future instead of a `GSource`.

use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    codec::{self, Decoder, Frame, FrameKind},
    error::{Error, ErrorKind},
};

const INITIAL_RTO: Duration = Duration::from_secs(1);
const MAX_RTO: Duration = Duration::from_secs(4);
const MAX_RETRIES: u32 = 3;
const READ_CHUNK: usize = 4096;

/// Why the link stopped accepting new traffic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Down {
    /// Retransmission budget exhausted for an outstanding send.
    LinkLost,
    /// The peer closed the stream (clean EOF or I/O error).
    PeerGone,
}

impl From<Down> for Error {
    fn from(down: Down) -> Self {
        match down {
            Down::LinkLost => Error::new(ErrorKind::LinkLost),
            Down::PeerGone => Error::new(ErrorKind::PeerGone),
        }
    }
}

struct SendReq {
    payload: Vec<u8>,
    ack_tx: oneshot::Sender<Result<(), Error>>,
}

struct PendingSend {
    wire: Vec<u8>,
    seq: u8,
    retries: u32,
    rto: Duration,
    deadline: Instant,
    ack_tx: oneshot::Sender<Result<(), Error>>,
}

/// Handle to a running link. Dropping it tears down the background task.
pub struct Link {
    send_tx: mpsc::UnboundedSender<SendReq>,
    down_rx: watch::Receiver<Option<Down>>,
}

impl Link {
    /// Spawns the link task over `stream` and returns the handle plus the
    /// inbound payload stream.
    pub fn spawn<S>(stream: S) -> (Self, UnboundedReceiverStream<Vec<u8>>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (down_tx, down_rx) = watch::channel(None);

        tokio::spawn(run(stream, send_rx, inbound_tx, down_tx));

        (Self { send_tx, down_rx }, UnboundedReceiverStream::new(inbound_rx))
    }

    /// Sends `payload` as a DATA frame, resolving once the peer has ACKed it
    /// or the retransmission budget has been exhausted.
    ///
    /// Multiple concurrent calls are queued FIFO; the link enforces "at most
    /// one unacknowledged DATA frame outbound" regardless of caller.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), Error> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_tx
            .send(SendReq { payload, ack_tx })
            .map_err(|_| Error::new(ErrorKind::PeerGone))?;
        ack_rx.await.map_err(|_| Error::new(ErrorKind::PeerGone))?
    }

    /// Resolves once the link has gone down, returning the reason.
    ///
    /// Safe to call from multiple tasks; every caller observes the same value.
    pub async fn closed(&self) -> Down {
        let mut rx = self.down_rx.clone();
        loop {
            if let Some(down) = *rx.borrow() {
                return down;
            }
            if rx.changed().await.is_err() {
                return Down::PeerGone;
            }
        }
    }
}

async fn run<S>(
    mut stream: S, mut cmd_rx: mpsc::UnboundedReceiver<SendReq>, inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    down_tx: watch::Sender<Option<Down>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut decoder = Decoder::new();
    let mut read_buf = [0u8; READ_CHUNK];
    let mut local_seq: u8 = 0;
    let mut last_acked_recv_seq: Option<u8> = None;
    let mut queue: std::collections::VecDeque<SendReq> = std::collections::VecDeque::new();
    let mut pending: Option<PendingSend> = None;

    let finish = |reason: Down, pending: &mut Option<PendingSend>, queue: &mut std::collections::VecDeque<SendReq>| {
        if let Some(p) = pending.take() {
            let _ = p.ack_tx.send(Err(reason.into()));
        }
        for req in queue.drain(..) {
            let _ = req.ack_tx.send(Err(reason.into()));
        }
    };

    loop {
        if pending.is_none() {
            if let Some(req) = queue.pop_front() {
                let wire = codec::encode(FrameKind::DataMdr, local_seq, &req.payload);
                if let Err(err) = stream.write_all(&wire).await {
                    log::warn!("link write failed while sending DATA: {err}");
                    finish(Down::PeerGone, &mut pending, &mut queue);
                    let _ = req.ack_tx.send(Err(Down::PeerGone.into()));
                    let _ = down_tx.send(Some(Down::PeerGone));
                    return;
                }
                pending = Some(PendingSend {
                    wire,
                    seq: local_seq,
                    retries: 0,
                    rto: INITIAL_RTO,
                    deadline: Instant::now() + INITIAL_RTO,
                    ack_tx: req.ack_tx,
                });
            }
        }

        let sleep = tokio::time::sleep_until(pending.as_ref().map(|p| p.deadline).unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)));
        tokio::pin!(sleep);

        tokio::select! {
            result = stream.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        log::debug!("link peer closed the stream");
                        finish(Down::PeerGone, &mut pending, &mut queue);
                        let _ = down_tx.send(Some(Down::PeerGone));
                        return;
                    }
                    Ok(n) => {
                        decoder.feed(&read_buf[..n]);
                        if !drain_frames(&mut decoder, &mut stream, &mut pending, &mut last_acked_recv_seq, &mut local_seq, &inbound_tx).await {
                            finish(Down::PeerGone, &mut pending, &mut queue);
                            let _ = down_tx.send(Some(Down::PeerGone));
                            return;
                        }
                    }
                    Err(err) => {
                        log::warn!("link read failed: {err}");
                        finish(Down::PeerGone, &mut pending, &mut queue);
                        let _ = down_tx.send(Some(Down::PeerGone));
                        return;
                    }
                }
            }

            req = cmd_rx.recv() => {
                match req {
                    Some(req) => queue.push_back(req),
                    None => return, // last Link handle dropped
                }
            }

            () = &mut sleep, if pending.is_some() => {
                let p = pending.as_mut().expect("guarded by pending.is_some()");
                if p.retries >= MAX_RETRIES {
                    log::warn!("link exhausted retransmission budget");
                    finish(Down::LinkLost, &mut pending, &mut queue);
                    let _ = down_tx.send(Some(Down::LinkLost));
                    return;
                }
                p.retries += 1;
                log::debug!("link retransmitting DATA frame (attempt {})", p.retries + 1);
                if let Err(err) = stream.write_all(&p.wire).await {
                    log::warn!("link write failed while retransmitting: {err}");
                    finish(Down::PeerGone, &mut pending, &mut queue);
                    let _ = down_tx.send(Some(Down::PeerGone));
                    return;
                }
                if p.retries >= MAX_RETRIES {
                    // Final retry sent; the budget is now exhausted, so complete
                    // without waiting for this attempt's ack.
                    log::warn!("link exhausted retransmission budget after final retry");
                    finish(Down::LinkLost, &mut pending, &mut queue);
                    let _ = down_tx.send(Some(Down::LinkLost));
                    return;
                }
                p.rto = (p.rto * 2).min(MAX_RTO);
                p.deadline = Instant::now() + p.rto;
            }
        }
    }
}

/// Drains every frame currently buffered in `decoder`, acking DATA frames,
/// completing the pending send on a matching ACK, and forwarding fresh
/// payloads to `inbound_tx`. Returns `false` if the stream should be torn down.
async fn drain_frames<S>(
    decoder: &mut Decoder, stream: &mut S, pending: &mut Option<PendingSend>, last_acked_recv_seq: &mut Option<u8>,
    local_seq: &mut u8, inbound_tx: &mpsc::UnboundedSender<Vec<u8>>,
) -> bool
where
    S: AsyncWrite + Unpin,
{
    loop {
        match decoder.poll() {
            codec::Poll::NeedMore => return true,
            codec::Poll::BadFrame(reason) => {
                log::warn!("discarding malformed frame: {reason}");
                continue;
            }
            codec::Poll::Frame(frame) => {
                if !handle_frame(frame, stream, pending, last_acked_recv_seq, local_seq, inbound_tx).await {
                    return false;
                }
            }
        }
    }
}

async fn handle_frame<S>(
    frame: Frame, stream: &mut S, pending: &mut Option<PendingSend>, last_acked_recv_seq: &mut Option<u8>,
    local_seq: &mut u8, inbound_tx: &mpsc::UnboundedSender<Vec<u8>>,
) -> bool
where
    S: AsyncWrite + Unpin,
{
    match frame.kind {
        FrameKind::Ack => {
            if let Some(p) = pending.as_ref() {
                if p.seq == frame.seq {
                    let p = pending.take().expect("checked above");
                    *local_seq ^= 1;
                    let _ = p.ack_tx.send(Ok(()));
                } else {
                    log::trace!("ignoring ACK for stale sequence {}", frame.seq);
                }
            } else {
                log::trace!("ignoring unexpected ACK");
            }
            true
        }
        FrameKind::DataMdr | FrameKind::DataMdrNo2 => {
            let ack_wire = codec::encode(FrameKind::Ack, frame.seq, &[]);
            if let Err(err) = stream.write_all(&ack_wire).await {
                log::warn!("link write failed while acking DATA: {err}");
                return false;
            }
            if *last_acked_recv_seq == Some(frame.seq) {
                log::trace!("dropping duplicate DATA frame (seq {})", frame.seq);
            } else {
                *last_acked_recv_seq = Some(frame.seq);
                let _ = inbound_tx.send(frame.payload);
            }
            true
        }
        FrameKind::Shot => {
            let _ = inbound_tx.send(frame.payload);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn send_completes_on_ack() {
        let (local, mut remote) = duplex(4096);
        let (link, _inbound) = Link::spawn(local);

        let send = tokio::spawn(async move { link.send(b"hello".to_vec()).await });

        // Play the remote peer: read the DATA frame, send back an ACK.
        let mut buf = [0u8; 256];
        let n = remote.read(&mut buf).await.unwrap();
        let mut dec = Decoder::new();
        dec.feed(&buf[..n]);
        let frame = match dec.poll() {
            codec::Poll::Frame(f) => f,
            other => panic!("expected frame, got {other:?}"),
        };
        assert_eq!(frame.kind, FrameKind::DataMdr);
        assert_eq!(frame.payload, b"hello");

        let ack = codec::encode(FrameKind::Ack, frame.seq, &[]);
        remote.write_all(&ack).await.unwrap();

        assert!(send.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn inbound_data_is_acked_and_delivered() {
        let (local, mut remote) = duplex(4096);
        let (_link, mut inbound) = Link::spawn(local);

        let data = codec::encode(FrameKind::DataMdr, 0, b"push");
        remote.write_all(&data).await.unwrap();

        let payload = inbound.next().await.unwrap();
        assert_eq!(payload, b"push");

        let mut buf = [0u8; 64];
        let n = remote.read(&mut buf).await.unwrap();
        let mut dec = Decoder::new();
        dec.feed(&buf[..n]);
        match dec.poll() {
            codec::Poll::Frame(f) => assert_eq!(f.kind, FrameKind::Ack),
            other => panic!("expected ack frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_data_frame_is_reacked_without_redelivery() {
        let (local, mut remote) = duplex(4096);
        let (_link, mut inbound) = Link::spawn(local);

        let data = codec::encode(FrameKind::DataMdr, 0, b"push");
        remote.write_all(&data).await.unwrap();
        let first = inbound.next().await.unwrap();
        assert_eq!(first, b"push");
        let mut buf = [0u8; 64];
        remote.read(&mut buf).await.unwrap(); // first ack

        // Replay: peer retransmits the identical frame.
        remote.write_all(&data).await.unwrap();
        let n = remote.read(&mut buf).await.unwrap();
        let mut dec = Decoder::new();
        dec.feed(&buf[..n]);
        assert!(matches!(dec.poll(), codec::Poll::Frame(f) if f.kind == FrameKind::Ack));

        // No second payload delivery.
        assert!(tokio::time::timeout(Duration::from_millis(50), inbound.next()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_send_exhausts_retries_and_reports_link_lost() {
        let (local, _remote) = duplex(4096);
        let (link, _inbound) = Link::spawn(local);

        let result = link.send(b"never-acked".to_vec()).await;
        assert!(matches!(result, Err(e) if e.kind == ErrorKind::LinkLost));
    }
}
