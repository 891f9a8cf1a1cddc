use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tempfile::NamedTempFile;

use stillframe::{StillframeConfig, StreamDescriptor, Tunables};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "STILLFRAME_CONFIG",
        "STILLFRAME_API_ADDR",
        "STILLFRAME_HOST",
        "STILLFRAME_PORT",
        "STILLFRAME_LOGIN",
        "STILLFRAME_PASSWORD",
        "STILLFRAME_QUALITY",
        "STILLFRAME_FPS",
        "STILLFRAME_MAX_WIDTH",
        "STILLFRAME_MAX_RETRIES",
        "STILLFRAME_RETRY_INTERVAL_SECS",
        "STILLFRAME_RECONNECT_TIMEOUT_SECS",
        "STILLFRAME_IDLE_TIMEOUT_SECS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(json.as_bytes())?;
    Ok(file)
}

#[test]
fn loads_full_config_with_env_overrides() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "streams": [
                { "url": " rtsp://10.0.0.4:554/h264 ", "name": "Driveway" },
                { "url": "http://10.0.0.9:81/stream", "name": "Garage" }
            ],
            "capture": {
                "fps": 5,
                "quality": 70,
                "max_width": 960,
                "max_retries": 4,
                "retry_interval_secs": 20,
                "idle_timeout_secs": 120
            },
            "api": { "addr": "127.0.0.1:9090", "login": "viewer", "password": "from-file" }
        }"#,
    )?;

    std::env::set_var("STILLFRAME_CONFIG", file.path());
    std::env::set_var("STILLFRAME_PASSWORD", "from-env");
    std::env::set_var("STILLFRAME_QUALITY", "55");
    std::env::set_var("STILLFRAME_PORT", "9191");

    let cfg = StillframeConfig::load()?;

    assert_eq!(
        cfg.streams,
        vec![
            StreamDescriptor::new("rtsp://10.0.0.4:554/h264", "Driveway"),
            StreamDescriptor::new("http://10.0.0.9:81/stream", "Garage"),
        ]
    );
    assert_eq!(cfg.tunables.fps, 5);
    assert_eq!(cfg.tunables.quality, 55);
    assert_eq!(cfg.tunables.max_width, 960);
    assert_eq!(cfg.tunables.max_retries, 4);
    assert_eq!(cfg.tunables.retry_interval, Duration::from_secs(20));
    assert_eq!(cfg.tunables.idle_timeout, Duration::from_secs(120));
    assert_eq!(cfg.tunables.reconnect_timeout, Tunables::default().reconnect_timeout);
    assert_eq!(cfg.api.addr, "127.0.0.1:9191");
    assert_eq!(cfg.api.login, "viewer");
    assert_eq!(cfg.api.password, "from-env");

    clear_env();
    Ok(())
}

#[test]
fn loads_bare_stream_array() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"[{ "url": "stub://porch", "name": "Porch" }]"#)?;
    std::env::set_var("STILLFRAME_LOGIN", "admin");
    std::env::set_var("STILLFRAME_PASSWORD", "secret");

    let cfg = StillframeConfig::load_from(Some(file.path()))?;
    assert_eq!(cfg.streams, vec![StreamDescriptor::new("stub://porch", "Porch")]);
    assert_eq!(cfg.tunables, Tunables::default());
    assert_eq!(cfg.api.addr, "0.0.0.0:8080");

    clear_env();
    Ok(())
}

#[test]
fn rejects_missing_credentials() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"[{ "url": "stub://porch", "name": "Porch" }]"#)?;
    let err = StillframeConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("login and password"));

    clear_env();
    Ok(())
}

#[test]
fn rejects_invalid_values() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("STILLFRAME_LOGIN", "admin");
    std::env::set_var("STILLFRAME_PASSWORD", "secret");

    let file = write_config(r#"{ "capture": { "quality": 101 } }"#)?;
    assert!(StillframeConfig::load_from(Some(file.path())).is_err());

    let file = write_config(r#"[{ "url": "   ", "name": "Blank" }]"#)?;
    let err = StillframeConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("empty url"));

    let file = write_config(r#"{ "streams": [], "unexpected": true }"#)?;
    assert!(StillframeConfig::load_from(Some(file.path())).is_err());

    std::env::set_var("STILLFRAME_FPS", "fast");
    let file = write_config("[]")?;
    let err = StillframeConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("STILLFRAME_FPS"));

    clear_env();
    Ok(())
}
