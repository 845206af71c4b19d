use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::cbt::{Cbt, CbtTag, Request};

/// One message delivered to a module's inbox.
#[derive(Debug)]
pub enum BusMsg {
    Request(Cbt),
    Response(Cbt),
    /// An in-flight operation whose parent was cancelled; the initiator gets
    /// a chance to release whatever the operation had allocated.
    Abort(Cbt),
}

pub type Inbox = mpsc::UnboundedReceiver<BusMsg>;

/// Routes [`Cbt`]s between modules and tracks every submitted request until
/// it is completed or scavenged.
#[derive(Clone, Default)]
pub struct Nexus {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    modules: HashMap<String, mpsc::UnboundedSender<BusMsg>>,
    /// Requests submitted and not yet completed, keyed by tag.
    pending: HashMap<CbtTag, Cbt>,
    /// Recipient-side parents awaiting the completion of child operations.
    parked: HashMap<CbtTag, Cbt>,
    next_tag: u64,
}

impl Nexus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a module under `name`, returning its bus handle and inbox.
    ///
    /// Re-attaching under an existing name replaces the previous inbox.
    pub fn register(&self, name: &str) -> (ModuleHandle, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().modules.insert(name.to_owned(), tx);

        let handle = ModuleHandle {
            name: name.to_owned(),
            nexus: self.clone(),
        };

        (handle, rx)
    }

    /// Closes every module inbox; their tasks drain and exit.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.modules.clear();
        inner.pending.clear();
        inner.parked.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Force-completes every pending request older than `timeout` with an
    /// expired error and delivers aborts for their in-flight children.
    pub fn scavenge_pending(&self, timeout: Duration, now: Instant) {
        let mut deliveries = Vec::new();

        {
            let mut inner = self.inner.lock();

            let expired = inner
                .pending
                .values()
                .filter(|cbt| now.duration_since(cbt.submitted_at) >= timeout)
                .map(|cbt| cbt.tag)
                .collect::<std::collections::HashSet<_>>();

            // Children of an expired parent are aborted, even when they
            // expired themselves; everything else that expired is
            // force-completed towards its initiator.
            let mut aborted = Vec::new();
            let mut force_completed = Vec::new();
            for cbt in inner.pending.values() {
                match cbt.parent {
                    Some(parent) if expired.contains(&parent) => aborted.push(cbt.tag),
                    _ if expired.contains(&cbt.tag) => force_completed.push(cbt.tag),
                    _ => {}
                }
            }

            for tag in aborted {
                let Some(child) = inner.pending.remove(&tag) else {
                    continue;
                };
                inner.parked.remove(&tag);
                deliveries.push((child.request.initiator.clone(), BusMsg::Abort(child)));
            }

            for tag in force_completed {
                let Some(mut cbt) = inner.pending.remove(&tag) else {
                    continue;
                };
                inner.parked.remove(&tag);

                tracing::warn!(%tag, action = %cbt.request.action, "Request expired before completion");
                cbt.set_response("The request has expired", false);
                deliveries.push((cbt.request.initiator.clone(), BusMsg::Response(cbt)));
            }
        }

        for (module, msg) in deliveries {
            self.route(&module, msg);
        }
    }

    fn alloc_tag(&self) -> CbtTag {
        let mut inner = self.inner.lock();
        let tag = CbtTag(inner.next_tag);
        inner.next_tag += 1;

        tag
    }

    fn route(&self, module: &str, msg: BusMsg) {
        let sender = self.inner.lock().modules.get(module).cloned();

        match sender {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    tracing::debug!(%module, "Inbox closed; message dropped");
                }
            }
            None => tracing::debug!(%module, "No such module; message dropped"),
        }
    }

    fn submit(&self, mut cbt: Cbt) {
        cbt.submitted_at = Instant::now();

        let routable = self.inner.lock().modules.contains_key(&cbt.request.recipient);
        if !routable {
            tracing::warn!(
                recipient = %cbt.request.recipient,
                action = %cbt.request.action,
                "Request to unknown module"
            );
            let initiator = cbt.request.initiator.clone();
            cbt.set_response("The recipient module is not attached", false);
            self.route(&initiator, BusMsg::Response(cbt));
            return;
        }

        self.inner.lock().pending.insert(cbt.tag, cbt.clone());

        let recipient = cbt.request.recipient.clone();
        self.route(&recipient, BusMsg::Request(cbt));
    }

    /// Completes a pending request by tag, without holding the `Cbt` value.
    ///
    /// Returns `false` when the tag is unknown (expired or never submitted).
    fn complete_pending(&self, tag: CbtTag, data: serde_json::Value, ok: bool) -> bool {
        let Some(mut cbt) = self.inner.lock().pending.remove(&tag) else {
            return false;
        };

        let initiator = cbt.request.initiator.clone();
        cbt.set_response(data, ok);
        self.route(&initiator, BusMsg::Response(cbt));

        true
    }

    fn complete(&self, cbt: Cbt) {
        let known = self.inner.lock().pending.remove(&cbt.tag).is_some();
        if !known {
            // Scavenged while the recipient was still working on it.
            tracing::debug!(tag = %cbt.tag, action = %cbt.request.action, "Releasing orphaned response");
            return;
        }

        let initiator = cbt.request.initiator.clone();
        self.route(&initiator, BusMsg::Response(cbt));
    }
}

/// A module's capability to originate and complete bus operations.
#[derive(Clone)]
pub struct ModuleHandle {
    name: String,
    nexus: Nexus,
}

impl ModuleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create(&self, recipient: &str, action: &str, params: impl Serialize) -> Cbt {
        let params = serde_json::to_value(params)
            .unwrap_or_else(|e| serde_json::Value::String(format!("unserializable params: {e}")));

        Cbt {
            tag: self.nexus.alloc_tag(),
            parent: None,
            request: Request {
                initiator: self.name.clone(),
                recipient: recipient.to_owned(),
                action: action.to_owned(),
                params,
            },
            response: None,
            submitted_at: Instant::now(),
        }
    }

    pub fn submit(&self, cbt: Cbt) -> CbtTag {
        let tag = cbt.tag;
        self.nexus.submit(cbt);

        tag
    }

    pub fn submit_new(&self, recipient: &str, action: &str, params: impl Serialize) -> CbtTag {
        self.submit(self.create(recipient, action, params))
    }

    /// Parks `parent` and submits a child operation on its behalf; completing
    /// the parent is the caller's job once the child resolves.
    pub fn submit_chained(
        &self,
        recipient: &str,
        action: &str,
        params: impl Serialize,
        parent: Cbt,
    ) -> CbtTag {
        let mut child = self.create(recipient, action, params);
        child.parent = Some(parent.tag);

        self.nexus.inner.lock().parked.insert(parent.tag, parent);
        self.submit(child)
    }

    /// Retrieves a parked parent. `None` means the parent expired or was
    /// aborted in the meantime; the caller treats the operation as orphaned.
    pub fn take_parent(&self, tag: Option<CbtTag>) -> Option<Cbt> {
        self.nexus.inner.lock().parked.remove(&tag?)
    }

    /// Routes a completed operation back to its initiator.
    pub fn complete(&self, cbt: Cbt) {
        debug_assert!(cbt.response.is_some(), "completing a cbt without a response");

        self.nexus.complete(cbt);
    }

    /// Completes `cbt` with the given response in one step.
    pub fn complete_with(&self, mut cbt: Cbt, data: impl Serialize, ok: bool) {
        cbt.set_response(data, ok);
        self.complete(cbt);
    }

    /// Completes a request this module did not initiate, looked up by tag.
    pub fn complete_pending(&self, tag: CbtTag, data: impl Serialize, ok: bool) -> bool {
        let data = serde_json::to_value(data)
            .unwrap_or_else(|e| serde_json::Value::String(format!("unserializable response: {e}")));

        self.nexus.complete_pending(tag, data, ok)
    }

    pub fn scavenge_pending(&self, timeout: Duration, now: Instant) {
        self.nexus.scavenge_pending(timeout, now);
    }
}

/// A controller module: reacts to requests, responses to its own requests,
/// and aborts. Handlers run on the module's task and must not block on I/O.
pub trait ControllerModule: Send + 'static {
    fn handle_request(&mut self, cbt: Cbt);
    fn handle_response(&mut self, cbt: Cbt);
    fn handle_abort(&mut self, cbt: Cbt) {
        tracing::debug!(tag = %cbt.tag, action = %cbt.request.action, "Releasing aborted operation");
    }
}

/// Drives `module` from its inbox until the nexus shuts down.
pub fn spawn_module<M: ControllerModule>(mut inbox: Inbox, mut module: M) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            match msg {
                BusMsg::Request(cbt) => module.handle_request(cbt),
                BusMsg::Response(cbt) => module.handle_response(cbt),
                BusMsg::Abort(cbt) => module.handle_abort(cbt),
            }
        }
    })
}

/// Request dispatch by action name, typed at registration.
pub struct HandlerTable<M> {
    handlers: HashMap<&'static str, fn(&mut M, Cbt)>,
}

impl<M> Default for HandlerTable<M> {
    fn default() -> Self {
        Self {
            handlers: HashMap::default(),
        }
    }
}

impl<M> HandlerTable<M> {
    pub fn insert(&mut self, action: &'static str, handler: fn(&mut M, Cbt)) {
        self.handlers.insert(action, handler);
    }

    /// Dispatches `cbt` to the registered handler, or hands it back.
    pub fn dispatch(&self, module: &mut M, cbt: Cbt) -> Result<(), Cbt> {
        match self.handlers.get(cbt.request.action.as_str()) {
            Some(handler) => {
                handler(module, cbt);
                Ok(())
            }
            None => Err(cbt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names;

    struct Echo {
        handle: ModuleHandle,
    }

    impl ControllerModule for Echo {
        fn handle_request(&mut self, mut cbt: Cbt) {
            let params = cbt.request.params.clone();
            cbt.set_response(params, true);
            self.handle.complete(cbt);
        }

        fn handle_response(&mut self, _: Cbt) {}
    }

    struct Probe {
        responses: mpsc::UnboundedSender<Cbt>,
        aborts: mpsc::UnboundedSender<Cbt>,
    }

    impl ControllerModule for Probe {
        fn handle_request(&mut self, _: Cbt) {}

        fn handle_response(&mut self, cbt: Cbt) {
            self.responses.send(cbt).unwrap();
        }

        fn handle_abort(&mut self, cbt: Cbt) {
            self.aborts.send(cbt).unwrap();
        }
    }

    fn probe(nexus: &Nexus, name: &str) -> (ModuleHandle, mpsc::UnboundedReceiver<Cbt>, mpsc::UnboundedReceiver<Cbt>) {
        let (handle, inbox) = nexus.register(name);
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let (abort_tx, abort_rx) = mpsc::unbounded_channel();
        spawn_module(
            inbox,
            Probe {
                responses: resp_tx,
                aborts: abort_tx,
            },
        );

        (handle, resp_rx, abort_rx)
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let nexus = Nexus::new();
        let (echo_handle, echo_inbox) = nexus.register("echo");
        spawn_module(echo_inbox, Echo { handle: echo_handle });
        let (handle, mut responses, _) = probe(&nexus, "caller");

        let tag = handle.submit_new("echo", "shout", serde_json::json!({"hello": "world"}));

        let cbt = responses.recv().await.unwrap();
        assert_eq!(cbt.tag, tag);
        assert!(cbt.ok());
        assert_eq!(cbt.response_data(), &serde_json::json!({"hello": "world"}));
        assert_eq!(nexus.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_recipient_fails_the_request() {
        let nexus = Nexus::new();
        let (handle, mut responses, _) = probe(&nexus, "caller");

        handle.submit_new("nobody", "noop", ());

        let cbt = responses.recv().await.unwrap();
        assert!(!cbt.ok());
    }

    #[tokio::test]
    async fn scavenge_expires_pending_and_aborts_children() {
        let nexus = Nexus::new();
        // A module that chains a child to a silent sink and never completes.
        struct Chainer {
            handle: ModuleHandle,
        }
        impl ControllerModule for Chainer {
            fn handle_request(&mut self, cbt: Cbt) {
                self.handle
                    .submit_chained("sink", names::DP_CREATE_LINK, (), cbt);
            }
            fn handle_response(&mut self, _: Cbt) {}
        }
        let (chainer_handle, chainer_inbox) = nexus.register("chainer");
        let (_, _sink_inbox) = nexus.register("sink");
        let chainer = Chainer {
            handle: chainer_handle.clone(),
        };
        let (_, mut chainer_aborts) = {
            // Wrap the chainer so its aborts are observable.
            let (abort_tx, abort_rx) = mpsc::unbounded_channel();
            struct Observed {
                inner: Chainer,
                aborts: mpsc::UnboundedSender<Cbt>,
            }
            impl ControllerModule for Observed {
                fn handle_request(&mut self, cbt: Cbt) {
                    self.inner.handle_request(cbt)
                }
                fn handle_response(&mut self, cbt: Cbt) {
                    self.inner.handle_response(cbt)
                }
                fn handle_abort(&mut self, cbt: Cbt) {
                    self.aborts.send(cbt).unwrap();
                }
            }
            spawn_module(
                chainer_inbox,
                Observed {
                    inner: chainer,
                    aborts: abort_tx,
                },
            );
            ((), abort_rx)
        };
        let (caller, mut responses, _) = probe(&nexus, "caller");

        caller.submit_new("chainer", names::CREATE_TUNNEL, ());
        // Wait until the child is pending too.
        while nexus.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        nexus.scavenge_pending(Duration::ZERO, Instant::now() + Duration::from_secs(1));

        let parent = responses.recv().await.unwrap();
        assert!(!parent.ok());
        let aborted_child = chainer_aborts.recv().await.unwrap();
        assert_eq!(aborted_child.request.action, names::DP_CREATE_LINK);
        assert_eq!(nexus.pending_count(), 0);
        // The parked parent is gone as well.
        assert!(chainer_handle.take_parent(Some(parent.tag)).is_none());
    }

    #[tokio::test]
    async fn orphaned_response_is_released_silently() {
        let nexus = Nexus::new();
        let (handle, mut responses, _) = probe(&nexus, "caller");

        let mut cbt = handle.create("caller", "noop", ());
        cbt.set_response((), true);
        // Never submitted: completing it must not deliver anything.
        handle.complete(cbt);

        tokio::task::yield_now().await;
        assert!(responses.try_recv().is_err());
    }
}
