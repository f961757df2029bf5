use assistant_realtime_server::config::{ConfigSet, CONFIG_DIR_ENV};

// 環境変数を触るため、このテストは単独ファイルに分離
#[test]
fn config_dir_env_var_overrides_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("server.yaml"),
        r#"
ws_bind_addr: "127.0.0.1:0"
auth:
  enabled: false
"#,
    )
    .expect("write server.yaml");
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
    .expect("write audio.yaml");
    std::fs::write(
        dir.path().join("providers.yaml"),
        r#"
selected:
  asr: mock
  tts: mock
  llm: mock
"#,
    )
    .expect("write providers.yaml");

    std::env::set_var(CONFIG_DIR_ENV, dir.path());
    let cfg = ConfigSet::load_from_env().expect("load config");
    std::env::remove_var(CONFIG_DIR_ENV);

    assert!(!cfg.server.auth.enabled);
    assert_eq!(cfg.root(), dir.path());
}
