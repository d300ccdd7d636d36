use sle_config::{Config, ConfigError, ConfigLoader};
use sle_core::{BackendKind, OverflowPolicy};
use std::fs;
use tempfile::TempDir;

fn load(files: &[(&str, &str)]) -> Result<Config, ConfigError> {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    ConfigLoader::new(dir.path()).load()
}

#[test]
fn loads_the_minimal_config() {
    let config = load(&[(
        "default.json",
        r#"{"LOKI_IP":"http://loki:3100","nginx":{"ACCESS":{"path_file":"/tmp/a.log"}}}"#,
    )])
    .unwrap();

    assert_eq!(config.backends.len(), 1);
    assert_eq!(config.backends[0].kind, BackendKind::Loki);
    assert_eq!(config.backends[0].endpoints, vec!["http://loki:3100"]);

    assert_eq!(config.sources.len(), 1);
    let source = &config.sources[0];
    assert_eq!(source.service, "nginx");
    assert_eq!(source.category, "ACCESS");
    assert_eq!(source.path, "/tmp/a.log");
    assert_eq!(source.delimiter, b"\n");
    assert_eq!(source.rate_limit, None);
    assert_eq!(source.buffer_size, 1);
    assert_eq!(source.overflow_policy, OverflowPolicy::Drop);
}

#[test]
fn endpoint_lists_and_scalars_normalize() {
    let config = load(&[(
        "default.json",
        r#"{"LOKI_IP":["http://a:3100","http://b:3100"]}"#,
    )])
    .unwrap();
    assert_eq!(
        config.backends[0].endpoints,
        vec!["http://a:3100", "http://b:3100"]
    );
}

#[test]
fn files_merge_into_one_config() {
    let config = load(&[
        (
            "default.yaml",
            "LOKI_IP: http://loki:3100\nAUTO_RELOAD: 5\nJOURNALCTL: \"on\"\nJOURNALCTL_LABELS:\n  host: web1\n",
        ),
        (
            "nginx.yml",
            "nginx:\n  ACCESS:\n    path_file: /var/log/nginx/access.log\n    disk_buffer: DISK\n    buffer_size: 50\n",
        ),
        (
            "postgres.json",
            r#"{"postgres":{"MAIN":{"path_file":"/var/log/postgresql/main.log","rate_limit":100}}}"#,
        ),
    ])
    .unwrap();

    assert_eq!(config.globals.auto_reload, 5);
    assert!(config.globals.journalctl);
    assert_eq!(
        config.globals.journal_labels.get("host").map(String::as_str),
        Some("web1")
    );

    assert_eq!(config.sources.len(), 2);
    let nginx = config
        .sources
        .iter()
        .find(|s| s.service == "nginx")
        .unwrap();
    assert_eq!(nginx.overflow_policy, OverflowPolicy::Disk);
    assert_eq!(nginx.buffer_size, 50);
    let postgres = config
        .sources
        .iter()
        .find(|s| s.service == "postgres")
        .unwrap();
    assert_eq!(postgres.rate_limit, Some(100.0));
}

#[test]
fn global_keys_outside_default_are_ignored() {
    let config = load(&[
        ("default.json", r#"{"LOKI_IP":"http://loki:3100"}"#),
        (
            "extra.json",
            r#"{"AUTO_RELOAD":60,"app":{"LOG":{"path_file":"/tmp/app.log"}}}"#,
        ),
    ])
    .unwrap();
    assert_eq!(config.globals.auto_reload, 0);
    assert_eq!(config.sources.len(), 1);
}

#[test]
fn service_and_category_names_are_sanitized() {
    let config = load(&[(
        "default.json",
        r#"{"../evil":{"sub/dir":{"path_file":"/tmp/x.log"}}}"#,
    )])
    .unwrap();
    let source = &config.sources[0];
    assert_eq!(source.service, "evil");
    assert_eq!(source.category, "subdir");
}

#[test]
fn relative_path_is_rejected() {
    let err = load(&[(
        "default.json",
        r#"{"app":{"LOG":{"path_file":"relative.log"}}}"#,
    )])
    .unwrap_err();
    assert!(err.to_string().contains("must be absolute"), "{err}");
}

#[test]
fn missing_path_is_rejected() {
    let err = load(&[("default.json", r#"{"app":{"LOG":{}}}"#)]).unwrap_err();
    assert!(err.to_string().contains("path_file"), "{err}");
}

#[test]
fn non_string_labels_are_rejected() {
    let err = load(&[(
        "default.json",
        r#"{"app":{"LOG":{"path_file":"/tmp/a.log","labels":{"port":8080}}}}"#,
    )])
    .unwrap_err();
    assert!(err.to_string().contains("strings"), "{err}");
}

#[test]
fn negative_rate_limit_is_rejected() {
    let err = load(&[(
        "default.json",
        r#"{"app":{"LOG":{"path_file":"/tmp/a.log","rate_limit":-1}}}"#,
    )])
    .unwrap_err();
    assert!(err.to_string().contains("rate_limit"), "{err}");
}

#[test]
fn unknown_backend_kind_is_rejected() {
    let err = load(&[("default.json", r#"{"MYSQL_IP":"http://db:3306"}"#)]).unwrap_err();
    assert!(err.to_string().contains("unknown backend kind"), "{err}");
}

#[test]
fn empty_endpoint_list_is_rejected() {
    let err = load(&[("default.json", r#"{"LOKI_IP":[]}"#)]).unwrap_err();
    assert!(err.to_string().contains("non-empty"), "{err}");
}

#[test]
fn unknown_source_fields_are_ignored() {
    let config = load(&[(
        "default.json",
        r#"{"app":{"LOG":{"path_file":"/tmp/a.log","typo_field":true}}}"#,
    )])
    .unwrap();
    assert_eq!(config.sources.len(), 1);
}

#[test]
fn same_backend_kind_merges_endpoints() {
    let config = load(&[
        ("a.json", r#"{"LOKI_IP":"http://a:3100"}"#),
        ("b.json", r#"{"LOKI_IP":["http://a:3100","http://b:3100"]}"#),
    ])
    .unwrap();
    assert_eq!(config.backends.len(), 1);
    assert_eq!(
        config.backends[0].endpoints,
        vec!["http://a:3100", "http://b:3100"]
    );
}

#[test]
fn reports_the_offending_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("broken.json"), "{not json").unwrap();
    let err = ConfigLoader::new(dir.path()).load().unwrap_err();
    assert!(err.to_string().contains("broken.json"), "{err}");
}

#[test]
fn journalctl_must_be_on_or_off() {
    let err = load(&[("default.json", r#"{"JOURNALCTL":"maybe"}"#)]).unwrap_err();
    assert!(err.to_string().contains("JOURNALCTL"), "{err}");
}
