//! Mock UART transport for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::traits::{TransportError, UartTransport};

/// Scripted peripheral behaviour for one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Peripheral answers with this payload (empty means plain ACK).
    Bytes(Vec<u8>),
    Timeout,
    Nak,
    Busy,
    /// Peripheral answers with a corrupted checksum.
    Checksum,
}

#[derive(Debug, Clone)]
struct Exchange {
    request: Vec<u8>,
    reply: MockReply,
}

/// Mock transport for unit testing bus and device logic.
///
/// Two modes: an ordered queue of expected exchanges (a request that does not
/// match the head of the queue is an error), or an unordered map from request
/// to response. In both modes an exhausted script answers with a timeout,
/// like a peripheral that went silent.
///
/// Cloning yields another handle to the same script, so a test can keep one
/// handle for inspection after handing the other to a [`Bus`](crate::Bus).
#[derive(Clone, Default)]
pub struct MockUart {
    queue: Arc<Mutex<VecDeque<Exchange>>>,
    map: Arc<Mutex<HashMap<Vec<u8>, MockReply>>>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    breaks: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

fn decode(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap_or_else(|e| panic!("MockUart: invalid hex {s:?}: {e}"))
}

impl MockUart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `request` next and answer with `response` (both hex).
    pub fn expect(&self, request: &str, response: &str) {
        self.expect_reply(request, MockReply::Bytes(decode(response)));
    }

    pub fn expect_timeout(&self, request: &str) {
        self.expect_reply(request, MockReply::Timeout);
    }

    pub fn expect_reply(&self, request: &str, reply: MockReply) {
        self.queue.lock().push_back(Exchange {
            request: decode(request),
            reply,
        });
    }

    /// Answer `request` with `response` any number of times, in any order.
    pub fn answer(&self, request: &str, response: &str) {
        self.map
            .lock()
            .insert(decode(request), MockReply::Bytes(decode(response)));
    }

    /// All requests seen so far, in order.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    /// Number of bus resets (breaks) performed.
    pub fn breaks(&self) -> usize {
        self.breaks.load(Ordering::SeqCst)
    }

    /// Scripted exchanges not yet consumed.
    pub fn remaining(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &[u8]) -> Result<MockReply, TransportError> {
        if let Some(reply) = self.map.lock().get(request) {
            return Ok(reply.clone());
        }
        let mut queue = self.queue.lock();
        match queue.front() {
            None => Ok(MockReply::Timeout),
            Some(ex) if ex.request != request => Err(TransportError::Mock(format!(
                "request expected={} actual={}",
                hex::encode(&ex.request),
                hex::encode(request)
            ))),
            Some(_) => Ok(queue
                .pop_front()
                .map(|ex| ex.reply)
                .unwrap_or(MockReply::Timeout)),
        }
    }
}

impl UartTransport for MockUart {
    fn open(&self, _path: &str) -> Result<(), TransportError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn brk(&self, _keep: Duration, _settle: Duration) -> Result<(), TransportError> {
        self.breaks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn tx(&self, request: &[u8], response: &mut [u8]) -> Result<usize, TransportError> {
        self.requests.lock().push(request.to_vec());
        match self.next_reply(request)? {
            MockReply::Bytes(data) => {
                if data.len() > response.len() {
                    return Err(TransportError::Mock(format!(
                        "response {} longer than buffer {}",
                        data.len(),
                        response.len()
                    )));
                }
                response[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            MockReply::Timeout => Err(TransportError::Timeout),
            MockReply::Nak => Err(TransportError::Nak),
            MockReply::Busy => Err(TransportError::Busy),
            MockReply::Checksum => Err(TransportError::InvalidChecksum {
                received: 0x00,
                actual: 0x01,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
