// # Blockwise Layer
//
// Minimal RFC 7959 support:
// - Block1: request bodies are reassembled per (peer, token) and handed on
//   once the last block arrives
// - Block2: responses larger than one block are cut to the block the request
//   asked for (block 0 by default)
//
// The server re-renders the resource for every Block2 follow-up, so no
// response-side state is kept.
//
// Reassembly is bounded twice: a body may not grow past `max_body_size`, and
// at most `upload_capacity` uploads are tracked. When a new upload would
// exceed the capacity, the one started longest ago is abandoned.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::debug;

use crate::config::BlockwiseConfig;
use crate::error::{Error, Result};
use crate::message::{BlockOption, Code, Request, Response};
use crate::resource::ResourceRef;
use crate::traits::blockwise::{BlockwiseLayer, BlockwiseRequest, ExchangeKey};

/// Largest size exponent (1024-byte blocks)
const MAX_SZX: u8 = 6;

#[derive(Debug, Default)]
struct UploadTable {
    uploads: HashMap<ExchangeKey, Vec<u8>>,
    order: VecDeque<ExchangeKey>,
}

impl UploadTable {
    fn received(&self, key: &ExchangeKey) -> usize {
        self.uploads.get(key).map(Vec::len).unwrap_or(0)
    }

    fn remove(&mut self, key: &ExchangeKey) -> Option<Vec<u8>> {
        let body = self.uploads.remove(key)?;
        self.order.retain(|other| other != key);
        Some(body)
    }

    fn append(&mut self, key: &ExchangeKey, block: &[u8], capacity: usize) {
        if let Some(body) = self.uploads.get_mut(key) {
            body.extend_from_slice(block);
            return;
        }

        while self.uploads.len() >= capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.uploads.remove(&oldest).is_some() {
                debug!(
                    "Abandoning Block1 upload from {} (token {})",
                    oldest.peer, oldest.token
                );
            }
        }
        self.uploads.insert(key.clone(), block.to_vec());
        self.order.push_back(key.clone());
    }
}

/// In-memory blockwise implementation
#[derive(Debug)]
pub struct Blockwise {
    szx: u8,
    max_body_size: usize,
    upload_capacity: usize,
    reassembly: Mutex<UploadTable>,
}

impl Blockwise {
    /// Create a blockwise layer from configuration
    pub fn new(config: &BlockwiseConfig) -> Self {
        Self {
            szx: config.szx().unwrap_or(MAX_SZX),
            max_body_size: config.max_body_size,
            upload_capacity: config.upload_capacity.max(1),
            reassembly: Mutex::new(UploadTable::default()),
        }
    }

    /// Number of uploads currently being reassembled
    pub fn pending_uploads(&self) -> usize {
        super::lock(&self.reassembly).uploads.len()
    }
}

impl Default for Blockwise {
    fn default() -> Self {
        Self::new(&BlockwiseConfig::default())
    }
}

impl BlockwiseLayer for Blockwise {
    fn request(&self, mut request: Request) -> Result<BlockwiseRequest> {
        let Some(block) = request.block1() else {
            return Ok(BlockwiseRequest::Complete(request));
        };
        let peer = request
            .source
            .ok_or_else(|| Error::invalid_input("request has no source"))?;
        let key = ExchangeKey::new(peer, request.token.clone());

        let mut reassembly = super::lock(&self.reassembly);
        if block.num == 0 {
            reassembly.remove(&key);
        }
        let received = reassembly.received(&key);
        if block.offset() != received {
            debug!(
                "Block1 {} from {} out of order (have {} bytes)",
                block.num, peer, received
            );
            reassembly.remove(&key);
            return Ok(BlockwiseRequest::Incomplete);
        }

        if received + request.payload.len() > self.max_body_size {
            debug!(
                "Block1 upload from {} exceeds {} bytes, dropping it",
                peer, self.max_body_size
            );
            reassembly.remove(&key);
            return Ok(BlockwiseRequest::TooLarge {
                limit: self.max_body_size,
            });
        }

        if block.more {
            reassembly.append(&key, &request.payload, self.upload_capacity);
            return Ok(BlockwiseRequest::Continue(BlockOption::new(
                block.num,
                true,
                block.szx.min(self.szx),
            )));
        }

        let mut body = reassembly.remove(&key).unwrap_or_default();
        body.extend_from_slice(&request.payload);
        request.payload = body;
        Ok(BlockwiseRequest::Complete(request))
    }

    fn response(
        &self,
        request: &Request,
        mut response: Response,
        resource: ResourceRef,
    ) -> Result<(Response, ResourceRef)> {
        let requested = request.block2();
        let szx = requested.map(|b| b.szx.min(self.szx)).unwrap_or(self.szx);
        let size = 1usize << (szx as usize + 4);

        if requested.is_none() && response.payload.len() <= size {
            return Ok((response, resource));
        }

        let num = requested.map(|b| b.num).unwrap_or(0);
        let block = BlockOption::new(num, false, szx);
        let offset = block.offset();
        let total = response.payload.len();
        if offset > 0 && offset >= total {
            response.code = Code::BAD_REQUEST;
            response.payload.clear();
            return Ok((response, resource));
        }

        let end = (offset + size).min(total);
        response.payload = response.payload[offset..end].to_vec();
        response.set_block2(BlockOption::new(num, end < total, szx));
        Ok((response, resource))
    }

    fn forget(&self, key: &ExchangeKey) {
        super::lock(&self.reassembly).remove(key);
    }
}
