use super::events::ClientCaptureEvent;

/// Downstream sink for the processed client event stream: the capture file
/// writer, the RPC service, or a test buffer. Events arrive in a total
/// order; every interning key an event references has been defined by an
/// earlier event.
pub trait ClientCaptureEventCollector: Send {
    fn add_event(&mut self, event: ClientCaptureEvent);

    /// Called once after the last event. Lets file sinks flush and close.
    fn finish(&mut self) {}
}

/// Collects everything into memory. Used by tests and short captures.
#[derive(Debug, Default)]
pub struct VecCollector {
    pub events: Vec<ClientCaptureEvent>,
}

impl ClientCaptureEventCollector for VecCollector {
    fn add_event(&mut self, event: ClientCaptureEvent) {
        self.events.push(event);
    }
}
