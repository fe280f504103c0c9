// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_app_core::settings::{ClientSettings, HostSettings};
use tether_client::{
    run, ConnectionEvent, LocalEdit, MessageHandler, MirrorChanges, Outputs, RunConfig,
    TransportLimits,
};
use tether_proto::FeatureValue;
use tether_session_service::demo::{INPUT, PROPS};
use tether_session_service::{handle_client, push_tick, DemoApp, HubState, SharedHub};
use tether_tree::ROOT_ID;
use tokio::net::UnixListener;

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tether-e2e-{}-{name}.sock", std::process::id()))
}

fn serve(path: &PathBuf) -> SharedHub {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path).unwrap();
    let app = Arc::new(DemoApp::new(3).unwrap());
    let hub = HubState::new(HostSettings::default(), app).shared();
    let accept_hub = hub.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_client(stream, accept_hub.clone()));
        }
    });
    hub
}

async fn wait_for_changes(rx: &Receiver<MirrorChanges>, pred: impl Fn(&MirrorChanges) -> bool) {
    for _ in 0..200 {
        while let Ok(changes) = rx.try_recv() {
            if pred(&changes) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for mirror changes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_mirror_tracks_the_host_tree() {
    let path = socket_path("mirror");
    let hub = serve(&path);

    let (changes_tx, changes_rx) = std::sync::mpsc::channel();
    let (events_tx, events_rx) = std::sync::mpsc::channel::<ConnectionEvent>();
    let (edits_tx, mut edits_rx) = tokio::sync::mpsc::unbounded_channel();
    let config = RunConfig {
        socket_path: path.clone(),
        settings: ClientSettings::default(),
        limits: TransportLimits::default(),
    };
    let client = tokio::spawn(async move {
        let mut handler = MessageHandler::new(config.settings.clone());
        let outputs = Outputs {
            changes: changes_tx,
            events: events_tx,
        };
        run(&config, &mut handler, &mut edits_rx, &outputs)
            .await
            .map(|()| handler)
    });

    wait_for_changes(&changes_rx, |c| c.resynchronized).await;

    edits_tx
        .send(LocalEdit {
            node: ROOT_ID,
            feature: INPUT,
            key: "text".into(),
            value: json!("typed"),
        })
        .unwrap();
    let session = loop {
        let handle = hub.lock().await.session("session-0");
        if let Some(handle) = handle {
            let typed = handle
                .lock()
                .await
                .tree()
                .map_get(ROOT_ID, INPUT, "text")
                .unwrap()
                .cloned();
            if typed == Some(FeatureValue::Value(json!("typed"))) {
                break handle;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    push_tick(&hub).await.unwrap();
    wait_for_changes(&changes_rx, |c| {
        c.keys.contains(&(ROOT_ID, PROPS, "ticks".to_owned()))
    })
    .await;

    drop(edits_tx);
    let handler = client.await.unwrap().unwrap();
    assert_eq!(handler.mirror().pending_count(), 0);
    assert_eq!(handler.mirror().view(), session.lock().await.tree().view());
    assert!(events_rx.try_recv().is_err());
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn client_gives_up_when_the_host_is_gone() {
    let path = socket_path("absent");
    let _ = std::fs::remove_file(&path);
    let (changes_tx, _changes_rx) = std::sync::mpsc::channel();
    let (events_tx, events_rx) = std::sync::mpsc::channel();
    let (_edits_tx, mut edits_rx) = tokio::sync::mpsc::unbounded_channel();
    let config = RunConfig {
        socket_path: path,
        settings: ClientSettings {
            reconnect_attempts: 2,
            reconnect_initial_ms: 1,
            reconnect_max_ms: 2,
            ..ClientSettings::default()
        },
        limits: TransportLimits::default(),
    };
    let mut handler = MessageHandler::new(config.settings.clone());
    let outputs = Outputs {
        changes: changes_tx,
        events: events_tx,
    };
    assert!(run(&config, &mut handler, &mut edits_rx, &outputs).await.is_err());
    let events: Vec<_> = events_rx.try_iter().collect();
    assert_eq!(events.last(), Some(&ConnectionEvent::Lost { attempts: 2 }));
}
