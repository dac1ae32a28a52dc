fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use slicepull_protocol::{
        CancelRequest, ChunkRequest, ChunkResponse, CreateSessionRequest, DoneEvent, Message,
        MessageType, Outcome, SessionCreated, SessionPhase, SessionProgress,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn read_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        serde_json::from_str(&read_fixture(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and
    /// compares the JSON values (order-independent).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_str(&read_fixture(name))
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    // --- Envelopes ---

    #[test]
    fn fixture_create_session_envelope() {
        let msg = roundtrip_test::<Message>("create_session_envelope.json");
        assert_eq!(msg.msg_type, MessageType::CreateSession);
        let req: CreateSessionRequest = msg.payload_as(MessageType::CreateSession).unwrap();
        assert_eq!(req.name, "disk.vhdx");
        assert_eq!(req.size, 1 << 30);
    }

    #[test]
    fn fixture_error_envelope() {
        let msg = roundtrip_test::<Message>("error_envelope.json");
        assert_eq!(msg.msg_type, MessageType::Error);
        assert!(msg.payload.is_none());
        assert_eq!(msg.error.unwrap().code, 400);
    }

    // --- Payloads ---

    #[test]
    fn fixture_create_session_request() {
        let req = roundtrip_test::<CreateSessionRequest>("create_session_request.json");
        assert_eq!(req.size, 250);
    }

    #[test]
    fn fixture_session_created() {
        roundtrip_test::<SessionCreated>("session_created.json");
    }

    #[test]
    fn fixture_chunk_request() {
        let req = roundtrip_test::<ChunkRequest>("chunk_request.json");
        assert_eq!(req.offset, 200);
        assert_eq!(req.size, 50);
    }

    #[test]
    fn fixture_chunk_response() {
        let resp = roundtrip_test::<ChunkResponse>("chunk_response.json");
        assert_eq!(resp.offset, 100);
        assert_eq!(resp.decode().unwrap(), b"Hello");
    }

    #[test]
    fn fixture_chunk_response_legacy_field() {
        // Older clients name the payload `buffer`; it is read but never written.
        let fixture = load_fixture("chunk_response_legacy.json");
        let resp: ChunkResponse = serde_json::from_value(fixture).unwrap();
        assert_eq!(resp.decode().unwrap(), b"Hello");
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            load_fixture("chunk_response.json")
        );
    }

    #[test]
    fn fixture_cancel_request() {
        let cancel = roundtrip_test::<CancelRequest>("cancel_request.json");
        assert!(cancel.reason.contains("exceeds"));
    }

    #[test]
    fn fixture_done_event() {
        let done = roundtrip_test::<DoneEvent>("done_event.json");
        assert!(!done.success);
    }

    #[test]
    fn fixture_session_progress() {
        let progress = roundtrip_test::<SessionProgress>("session_progress.json");
        assert_eq!(progress.phase, SessionPhase::AwaitingResponse);
        assert!((progress.percentage() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fixture_session_progress_done() {
        let progress = roundtrip_test::<SessionProgress>("session_progress_done.json");
        assert_eq!(progress.phase, SessionPhase::Done(Outcome::Success));
        assert!(progress.created_at.is_empty());
    }

    #[test]
    fn every_fixture_is_covered() {
        let covered = [
            "cancel_request.json",
            "chunk_request.json",
            "chunk_response.json",
            "chunk_response_legacy.json",
            "create_session_envelope.json",
            "create_session_request.json",
            "done_event.json",
            "error_envelope.json",
            "session_created.json",
            "session_progress.json",
            "session_progress_done.json",
        ];
        let mut found: Vec<String> = fs::read_dir(fixtures_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".json"))
            .collect();
        found.sort();
        assert_eq!(found, covered);
    }
}
