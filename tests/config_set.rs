use assistant_realtime_server::config::{ConfigError, ConfigSet};

fn write_config_dir(dir: &std::path::Path) {
    std::fs::write(
        dir.join("server.yaml"),
        r#"
ws_bind_addr: "127.0.0.1:0"
auth:
  enabled: true
  auth_key: "test-key"
drain_timeout_secs: 3
max_concurrent_sessions: 8
"#,
    )
    .expect("write server.yaml");

    std::fs::write(
        dir.join("audio.yaml"),
        r#"
input:
  sample_rate_hz: 16000
  channels: 1
  frame_duration_ms: 60
vad:
  energy_threshold: 500.0
  hangover_frames: 3
segmenter:
  pre_roll_frames: 10
  min_utterance_frames: 15
  silence_stop_frames: 8
"#,
    )
    .expect("write audio.yaml");

    std::fs::write(
        dir.join("providers.yaml"),
        r#"
selected:
  asr: mock
  tts: mock
  llm: mock
"#,
    )
    .expect("write providers.yaml");
}

#[test]
fn config_loads_from_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_config_dir(dir.path());

    let cfg = ConfigSet::load_from_dir(dir.path()).expect("load config");
    assert_eq!(cfg.server.auth.auth_key, "test-key");
    assert_eq!(cfg.server.drain_timeout_secs, 3);
    assert_eq!(cfg.audio.frame_samples(), 960);
    assert_eq!(cfg.providers.selected.llm, "mock");
}

#[test]
fn missing_dir_is_reported() {
    let err = ConfigSet::load_from_dir("/nonexistent/config/dir").unwrap_err();
    assert!(matches!(err, ConfigError::MissingRoot(_)));
}

#[test]
fn broken_yaml_is_parse_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_config_dir(dir.path());
    std::fs::write(dir.path().join("audio.yaml"), "input: [not a mapping")
        .expect("overwrite audio.yaml");

    let err = ConfigSet::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn segmenter_defaults_apply_when_omitted() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_config_dir(dir.path());
    std::fs::write(
        dir.path().join("audio.yaml"),
        r#"
input:
  sample_rate_hz: 16000
  channels: 1
  frame_duration_ms: 60
vad:
  energy_threshold: 500.0
  hangover_frames: 3
segmenter: {}
"#,
    )
    .expect("overwrite audio.yaml");

    let cfg = ConfigSet::load_from_dir(dir.path()).expect("load config");
    assert_eq!(cfg.audio.segmenter.pre_roll_frames, 10);
    assert_eq!(cfg.audio.segmenter.min_utterance_frames, 15);
    assert_eq!(cfg.audio.segmenter.silence_stop_frames, 8);
}
