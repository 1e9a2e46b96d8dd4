// # Notification Builder
//
// Turns a stored subscription into an outbound message. Notifications reuse
// the regular response pipeline (blockwise, reliability, matcher) with the
// subscriber's request marked as already acknowledged, so the reliability
// layer makes them confirmable instead of piggybacking.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::{Code, Request, Response};
use crate::resource::ResourceRef;
use crate::traits::{BlockwiseLayer, ExchangeKey, MessageMatcher, ReliabilityLayer};

use super::Notification;

/// Builds notifications and ordinary responses through the post-processing chain
#[derive(Clone)]
pub struct NotificationBuilder {
    blockwise: Arc<dyn BlockwiseLayer>,
    reliability: Arc<dyn ReliabilityLayer>,
    matcher: Arc<dyn MessageMatcher>,
}

impl NotificationBuilder {
    pub fn new(
        blockwise: Arc<dyn BlockwiseLayer>,
        reliability: Arc<dyn ReliabilityLayer>,
        matcher: Arc<dyn MessageMatcher>,
    ) -> Self {
        Self {
            blockwise,
            reliability,
            matcher,
        }
    }

    /// Build a notification carrying the resource's current state
    ///
    /// The Observe option carries the resource's current counter. A resource
    /// without a GET handler yields 4.05; any other render failure yields 5.00.
    pub fn prepare_notification(
        &self,
        resource: ResourceRef,
        request: Request,
        old_response: &Response,
    ) -> Result<Notification> {
        let mut response = addressed_like(old_response);
        response.set_observe(resource.observe_count());

        match resource.behaviour().render_get(&request) {
            Ok(representation) => {
                response.code = Code::CONTENT;
                if let Some(format) = representation.content_format {
                    response.set_content_format(format);
                }
                response.payload = representation.payload;
            }
            Err(Error::MethodNotAllowed(_)) => {
                response.code = Code::METHOD_NOT_ALLOWED;
            }
            Err(e) => {
                warn!("Rendering {} for a notification failed: {}", resource.path(), e);
                response.code = Code::INTERNAL_SERVER_ERROR;
            }
        }

        self.finish(resource, request, response)
    }

    /// Build a 4.04 notice telling the observer the resource is gone
    ///
    /// Carries no Observe option, which ends the relation on the client side.
    pub fn prepare_notification_deletion(
        &self,
        resource: ResourceRef,
        request: Request,
        old_response: &Response,
    ) -> Result<Notification> {
        let response = addressed_like(old_response).with_code(Code::NOT_FOUND);
        self.finish(resource, request, response)
    }

    /// Run a response through blockwise, reliability and matcher, in that order
    pub fn post_process(
        &self,
        request: &Request,
        response: Response,
        resource: ResourceRef,
    ) -> Result<(Response, ResourceRef)> {
        let (response, resource) = self.blockwise.response(request, response, resource)?;
        let (response, resource) = self.reliability.response(request, response, resource)?;
        self.matcher.response(request, response, resource)
    }

    fn finish(
        &self,
        resource: ResourceRef,
        mut request: Request,
        response: Response,
    ) -> Result<Notification> {
        if let Some(peer) = response.destination {
            self.blockwise
                .forget(&ExchangeKey::new(peer, response.token.clone()));
        }
        request.acknowledged = true;

        let (response, resource) = self.post_process(&request, response, resource)?;
        debug!(
            "Prepared {} notification for {:?} about {}",
            response.code,
            response.destination,
            resource.path()
        );

        Ok(Notification {
            resource,
            request,
            response,
        })
    }
}

impl std::fmt::Debug for NotificationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBuilder").finish_non_exhaustive()
    }
}

/// Fresh response to the same endpoint and token as `old`
fn addressed_like(old: &Response) -> Response {
    let mut response = Response::new();
    response.destination = old.destination;
    response.token = old.token.clone();
    response
}
