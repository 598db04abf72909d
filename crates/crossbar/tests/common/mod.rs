#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbar::providers::mock::MockProvider;
use crossbar::{
    AdaptorFactory, ChatMessage, Context, Gateway, GatewayConfig, GatewayError, Key, Provider,
    ProviderConfig, ProviderId, Request, SpanHandle, SpanKind, SpanStatus, Tracer,
};

/// Captures every finished span so tests can assert on the span tree.
#[derive(Default)]
pub struct RecordingTracer {
    ended: Mutex<Vec<EndedSpan>>,
    deferred: Mutex<HashMap<String, SpanHandle>>,
}

#[derive(Clone)]
pub struct EndedSpan {
    pub name: String,
    pub kind: SpanKind,
    pub status: SpanStatus,
    pub message: String,
    pub attributes: Vec<(String, String)>,
}

impl EndedSpan {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl RecordingTracer {
    pub fn ended(&self) -> Vec<EndedSpan> {
        self.ended.lock().unwrap().clone()
    }

    pub fn find(&self, name: &str) -> Option<EndedSpan> {
        self.ended().into_iter().find(|s| s.name == name)
    }

    pub fn count(&self, name: &str) -> usize {
        self.ended().iter().filter(|s| s.name == name).count()
    }
}

impl Tracer for RecordingTracer {
    fn end_span(&self, span: SpanHandle, status: SpanStatus, message: &str) {
        self.ended.lock().unwrap().push(EndedSpan {
            name: span.name.clone(),
            kind: span.kind,
            status,
            message: message.to_string(),
            attributes: span.attributes(),
        });
    }

    fn store_deferred_span(&self, trace_id: &str, span: SpanHandle) {
        self.deferred.lock().unwrap().insert(trace_id.to_string(), span);
    }

    fn take_deferred_span(&self, trace_id: &str) -> Option<SpanHandle> {
        self.deferred.lock().unwrap().remove(trace_id)
    }

    fn stop(&self) {}
}

pub struct Harness {
    pub gateway: Arc<Gateway>,
    mocks: Arc<Mutex<HashMap<ProviderId, Arc<MockProvider>>>>,
    pub tracer: Arc<RecordingTracer>,
    pub account: Arc<crossbar::StaticAccount>,
}

impl Harness {
    pub fn mock(&self, provider: &ProviderId) -> Arc<MockProvider> {
        self.mocks.lock().unwrap()[provider].clone()
    }

    /// Registers a mock adaptor for a provider the gateway has not created
    /// yet, so lazy initialization can find it through the factory.
    pub fn add_mock(&self, provider: ProviderId) -> Arc<MockProvider> {
        let mock = MockProvider::new(provider.clone());
        self.mocks.lock().unwrap().insert(provider, mock.clone());
        mock
    }

    /// Drops the mock adaptor so the next factory call for this provider
    /// fails.
    pub fn remove_mock(&self, provider: &ProviderId) {
        self.mocks.lock().unwrap().remove(provider);
    }

    pub fn ctx(&self) -> Context {
        self.gateway.new_context()
    }
}

pub async fn harness(providers: Vec<(ProviderId, ProviderConfig, Vec<Key>)>) -> Harness {
    harness_with_config(GatewayConfig::default(), providers).await
}

pub async fn harness_with_config(
    config: GatewayConfig,
    providers: Vec<(ProviderId, ProviderConfig, Vec<Key>)>,
) -> Harness {
    let account = Arc::new(crossbar::StaticAccount::new());
    let mocks = Arc::new(Mutex::new(HashMap::new()));
    for (provider, provider_config, keys) in providers {
        account.set_provider(provider.clone(), provider_config);
        account.set_keys(provider.clone(), keys);
        mocks
            .lock()
            .unwrap()
            .insert(provider.clone(), MockProvider::new(provider));
    }

    let factory_mocks = mocks.clone();
    let factory: AdaptorFactory = Box::new(move |provider, _config| {
        factory_mocks
            .lock()
            .unwrap()
            .get(provider)
            .cloned()
            .map(|mock| mock as Arc<dyn Provider>)
            .ok_or_else(|| {
                GatewayError::not_configured(format!("no mock adaptor for {provider}")).boxed()
            })
    });

    let gateway = Gateway::new(config, account.clone(), factory)
        .await
        .expect("gateway construction");
    let tracer = Arc::new(RecordingTracer::default());
    gateway.set_tracer(tracer.clone());

    Harness {
        gateway: Arc::new(gateway),
        mocks,
        tracer,
        account,
    }
}

pub fn key(id: &str) -> Key {
    Key::new(id, id, format!("sk-{id}"))
}

pub fn batch_key(id: &str) -> Key {
    let mut key = key(id);
    key.batch_eligible = true;
    key
}

pub fn chat_request(provider: ProviderId, model: &str) -> Request {
    Request::chat(provider, model, vec![ChatMessage::user("hello")])
}

pub fn chat_stream_request(provider: ProviderId, model: &str) -> Request {
    let mut request = chat_request(provider, model);
    request.kind = crossbar::RequestKind::ChatStream;
    request
}
