//! Service-level dispatch state shared by every channel pump.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use courier_transport::ChannelId;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::channel::ResolvedChannel;
use crate::config::{ConfigError, DispatchSettings};
use crate::error::{ErrorHandler, LoggingErrorHandler};
use crate::filter::{EndpointFilterTable, ExactFilterTable};
use crate::pipeline::DispatchPipeline;
use crate::throttle::ServiceThrottle;

/// Settings, throttle, endpoints and the set of active logical channels.
pub struct ChannelDispatcher {
    settings: DispatchSettings,
    throttle: Arc<ServiceThrottle>,
    error_handler: Arc<dyn ErrorHandler>,
    filter: Arc<dyn EndpointFilterTable>,
    endpoints: Vec<Arc<DispatchPipeline>>,
    active: DashMap<ChannelId, Arc<ResolvedChannel>>,
    calls_in_flight: AtomicUsize,
}

impl ChannelDispatcher {
    pub fn builder(settings: DispatchSettings) -> ChannelDispatcherBuilder {
        ChannelDispatcherBuilder {
            settings,
            throttle: None,
            error_handler: None,
            filter: None,
            endpoints: Vec::new(),
        }
    }

    /// Settings every pump on this dispatcher reads timeouts from.
    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// The throttle shared by all channels of this dispatcher.
    pub fn throttle(&self) -> &Arc<ServiceThrottle> {
        &self.throttle
    }

    pub fn error_handler(&self) -> &dyn ErrorHandler {
        self.error_handler.as_ref()
    }

    /// Maps a message's destination to an endpoint index.
    pub fn filter(&self) -> &dyn EndpointFilterTable {
        self.filter.as_ref()
    }

    /// Frozen endpoints, in registration order.
    pub fn endpoints(&self) -> &[Arc<DispatchPipeline>] {
        &self.endpoints
    }

    /// Endpoint at `index`, as returned by the filter table.
    pub fn endpoint(&self, index: usize) -> Option<&Arc<DispatchPipeline>> {
        self.endpoints.get(index)
    }

    /// Registered channels. Sessions stay registered until the channel closes.
    pub fn active_channels(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, channel: ChannelId) -> bool {
        self.active.contains_key(&channel)
    }

    /// Calls created and not yet cleaned up.
    pub fn calls_in_flight(&self) -> usize {
        self.calls_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn activate(&self, channel: Arc<ResolvedChannel>) {
        debug!(channel = %channel.id(), endpoint = channel.endpoint(), "channel activated");
        self.active.insert(channel.id(), channel);
    }

    pub(crate) fn deactivate(&self, channel: ChannelId) -> Option<Arc<ResolvedChannel>> {
        self.active.remove(&channel).map(|(_, channel)| channel)
    }

    pub(crate) fn call_started(&self) {
        self.calls_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn call_finished(&self) {
        self.calls_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ChannelDispatcherBuilder {
    settings: DispatchSettings,
    throttle: Option<Arc<ServiceThrottle>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    filter: Option<Arc<dyn EndpointFilterTable>>,
    endpoints: Vec<Arc<DispatchPipeline>>,
}

impl ChannelDispatcherBuilder {
    /// Add a frozen endpoint. Endpoint indices follow registration order.
    pub fn endpoint(mut self, pipeline: Arc<DispatchPipeline>) -> Self {
        self.endpoints.push(pipeline);
        self
    }

    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Replace the exact-match table derived from the endpoints.
    pub fn filter(mut self, filter: impl EndpointFilterTable + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Share a throttle between dispatchers instead of building one from the settings.
    pub fn throttle(mut self, throttle: Arc<ServiceThrottle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn build(self) -> Result<Arc<ChannelDispatcher>, ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::Invalid("a dispatcher needs at least one endpoint".into()));
        }
        let filter = match self.filter {
            Some(filter) => filter,
            None => {
                let mut table = ExactFilterTable::new();
                for pipeline in &self.endpoints {
                    table.add_endpoint(
                        pipeline.address().clone(),
                        pipeline.actions().map(str::to_string),
                        pipeline.accepts_any_action(),
                    );
                }
                Arc::new(table)
            }
        };
        let throttle = self
            .throttle
            .unwrap_or_else(|| Arc::new(ServiceThrottle::new(&self.settings.throttle)));

        info!(endpoints = self.endpoints.len(), "dispatcher ready");
        Ok(Arc::new(ChannelDispatcher {
            settings: self.settings,
            throttle,
            error_handler: self.error_handler.unwrap_or_else(|| Arc::new(LoggingErrorHandler)),
            filter,
            endpoints: self.endpoints,
            active: DashMap::new(),
            calls_in_flight: AtomicUsize::new(0),
        }))
    }
}
