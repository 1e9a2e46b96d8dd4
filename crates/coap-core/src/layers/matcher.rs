// # Matcher
//
// Assigns message ids and keeps a bounded, insertion-ordered table of
// outbound CON/NON exchanges keyed by (peer, message id). Piggybacked ACKs
// are not recorded: nothing ever answers them.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};

use tracing::debug;

use crate::config::MatcherConfig;
use crate::error::Result;
use crate::message::{MessageType, Request, Response};
use crate::resource::ResourceRef;
use crate::traits::matcher::{Exchange, MessageMatcher};

type ExchangeId = (SocketAddr, u16);

#[derive(Debug, Default)]
struct ExchangeTable {
    exchanges: HashMap<ExchangeId, Exchange>,
    order: VecDeque<ExchangeId>,
}

/// In-memory matcher
#[derive(Debug)]
pub struct Matcher {
    next_mid: AtomicU16,
    capacity: usize,
    table: Mutex<ExchangeTable>,
}

impl Matcher {
    /// Create a matcher whose first message id is derived from the clock
    pub fn new(config: &MatcherConfig) -> Self {
        let seed = chrono::Utc::now().timestamp_subsec_nanos() as u16;
        Self::with_initial_message_id(config, seed)
    }

    /// Create a matcher with a fixed first message id
    pub fn with_initial_message_id(config: &MatcherConfig, mid: u16) -> Self {
        Self {
            next_mid: AtomicU16::new(mid),
            capacity: config.exchange_capacity.max(1),
            table: Mutex::new(ExchangeTable::default()),
        }
    }

    /// Number of remembered exchanges
    pub fn exchange_count(&self) -> usize {
        super::lock(&self.table).exchanges.len()
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(&MatcherConfig::default())
    }
}

impl MessageMatcher for Matcher {
    fn response(
        &self,
        request: &Request,
        mut response: Response,
        resource: ResourceRef,
    ) -> Result<(Response, ResourceRef)> {
        let mid = match response.message_id {
            Some(mid) => mid,
            None => {
                let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
                response.message_id = Some(mid);
                mid
            }
        };

        let tracked = matches!(
            response.mtype,
            MessageType::Confirmable | MessageType::NonConfirmable
        );
        if let (true, Some(peer)) = (tracked, response.destination) {
            let id = (peer, mid);
            let mut table = super::lock(&self.table);
            let exchange = Exchange {
                resource: resource.clone(),
                request: request.clone(),
                response: response.clone(),
            };
            if table.exchanges.insert(id, exchange).is_none() {
                table.order.push_back(id);
            }
            while table.exchanges.len() > self.capacity {
                let Some(oldest) = table.order.pop_front() else {
                    break;
                };
                if table.exchanges.remove(&oldest).is_some() {
                    debug!("Forgetting exchange mid {} with {}", oldest.1, oldest.0);
                }
            }
        }

        Ok((response, resource))
    }

    fn take_exchange(&self, peer: SocketAddr, message_id: u16) -> Option<Exchange> {
        let id = (peer, message_id);
        let mut table = super::lock(&self.table);
        let exchange = table.exchanges.remove(&id)?;
        table.order.retain(|other| *other != id);
        Some(exchange)
    }
}
