// Shared fixtures for the behavior tests
pub use noticewatch_core::{
    AcceptedEvent, NoopHttpClient, NoticeClient, NoticeOutcome, PipelineConfig, ProcessOptions,
    RawNotice, Timestamp,
};
pub use noticewatch_store::{EventRecord, Store, StoreConfig};
pub use std::sync::Arc;
pub use tempfile::TempDir;

/// 2024-03-01T01:00:00Z, 10:00 in the board's local time.
pub const NOW: Timestamp = Timestamp::from_millis(1_709_254_800_000);

pub fn open_store() -> (TempDir, Store) {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Store::open(StoreConfig::in_dir(temp.path())).expect("store open");
    (temp, store)
}

/// Client over a temp store with no upstream.
pub fn offline_client() -> (TempDir, NoticeClient) {
    client_with(PipelineConfig::default(), Arc::new(NoopHttpClient))
}

pub fn client_with(
    config: PipelineConfig,
    http: Arc<dyn noticewatch_core::HttpClient>,
) -> (TempDir, NoticeClient) {
    let (temp, store) = open_store();
    let client = NoticeClient::from_config(config, store, http).expect("client");
    (temp, client)
}

pub fn notice(id: &str, title: &str, published_at: Timestamp) -> RawNotice {
    RawNotice {
        id: id.to_string(),
        title: title.to_string(),
        content: String::new(),
        categories: Vec::new(),
        url: format!("https://exchange.test/notice/{id}"),
        published_at,
    }
}

pub fn record(event_id: &str, base: &str, created_at: i64) -> EventRecord {
    EventRecord {
        event_id: event_id.to_string(),
        source: "notice-api".to_string(),
        base: base.to_string(),
        url: "https://exchange.test/notice/1".to_string(),
        markets: vec!["KRW".to_string()],
        trade_time_utc: None,
        raw_title: format!("신규 거래지원 안내 ({base})"),
        created_at,
    }
}

pub fn accepted(outcomes: &[NoticeOutcome]) -> Vec<&AcceptedEvent> {
    outcomes.iter().filter_map(NoticeOutcome::accepted).collect()
}
