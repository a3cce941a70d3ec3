mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use fdl::config::SETTING_MAX_CONCURRENT;
use fdl::state;
use fdl::worker::RetryPolicy;
use fdl::{AddRequest, DownloadStatus, EngineConfig, JsonStore, QueueScheduler, TaskStore};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn scheduler_with(store: Arc<JsonStore>, config: EngineConfig) -> QueueScheduler {
    QueueScheduler::new(store, config, None).unwrap()
}

fn request(server: &MockServer, file: &str, dir: &TempDir) -> AddRequest {
    let mut request = AddRequest::new(format!("{}{}", server.uri(), file));
    request.save_path = Some(dir.path().join(file.trim_start_matches('/')));
    request.connections = Some(2);
    request.skip_probe = true;
    request
}

fn status_of(scheduler: &QueueScheduler, id: &str) -> Option<DownloadStatus> {
    scheduler.task(id).map(|t| t.status)
}

#[tokio::test]
async fn running_tasks_never_exceed_the_ceiling() {
    let server = MockServer::start().await;
    let body = pattern(4_000);
    for file in ["/a.bin", "/b.bin", "/c.bin"] {
        mount_file(&server, file, &body, Duration::from_millis(200)).await;
    }
    let store = Arc::new(JsonStore::in_memory());
    store.set_setting(SETTING_MAX_CONCURRENT, "1").unwrap();
    let scheduler = scheduler_with(store.clone(), test_config());

    let dir = TempDir::new().unwrap();
    let mut ids = Vec::new();
    for file in ["/a.bin", "/b.bin", "/c.bin"] {
        ids.push(scheduler.add(request(&server, file, &dir)).await.unwrap());
    }

    let mut peak = 0;
    let finished = wait_for(Duration::from_secs(20), || {
        let tasks = scheduler.tasks();
        let running = tasks
            .iter()
            .filter(|t| t.status == DownloadStatus::Downloading)
            .count();
        peak = peak.max(running);
        tasks.iter().all(|t| t.status == DownloadStatus::Completed)
    })
    .await;

    assert!(finished, "tasks did not complete: {:?}", scheduler.tasks());
    assert_eq!(peak, 1);
    for file in ["a.bin", "b.bin", "c.bin"] {
        assert_eq!(std::fs::read(dir.path().join(file)).unwrap(), body);
    }
    for row in store.rows().unwrap() {
        assert_eq!(row.status, DownloadStatus::Completed);
        assert_eq!(row.downloaded, body.len() as u64);
        assert!(row.completed_at.is_some());
    }
}

#[tokio::test]
async fn priority_first_then_arrival_order() {
    let server = MockServer::start().await;
    let body = pattern(1_000);
    for file in ["/first.bin", "/second.bin", "/urgent.bin"] {
        mount_file(&server, file, &body, Duration::from_millis(50)).await;
    }
    let store = Arc::new(JsonStore::in_memory());
    store.set_setting(SETTING_MAX_CONCURRENT, "1").unwrap();
    let scheduler = scheduler_with(store, test_config());
    let dir = TempDir::new().unwrap();

    let mut ids = Vec::new();
    for (file, priority) in [("/first.bin", 1), ("/second.bin", 1), ("/urgent.bin", 5)] {
        let mut req = request(&server, file, &dir);
        req.priority = priority;
        req.auto_start = false;
        ids.push(scheduler.add(req).await.unwrap());
    }
    assert!(ids.iter().all(|id| status_of(&scheduler, id) == Some(DownloadStatus::Queued)));

    scheduler.admit();
    let done = wait_for(Duration::from_secs(20), || {
        scheduler
            .tasks()
            .iter()
            .all(|t| t.status == DownloadStatus::Completed)
    })
    .await;
    assert!(done);

    let mut order: Vec<_> = scheduler
        .tasks()
        .into_iter()
        .map(|t| (t.started_at.unwrap(), t.filename))
        .collect();
    order.sort();
    let names: Vec<String> = order.into_iter().map(|(_, name)| name).collect();
    assert_eq!(names, ["urgent.bin", "first.bin", "second.bin"]);
}

#[tokio::test]
async fn interrupted_rows_come_back_paused() {
    let store = Arc::new(JsonStore::in_memory());
    let scheduler = scheduler_with(store.clone(), test_config());
    let dir = TempDir::new().unwrap();

    let mut req = AddRequest::new("http://127.0.0.1:9/file.zip");
    req.save_path = Some(dir.path().join("file.zip"));
    req.skip_probe = true;
    req.auto_start = false;
    let id = scheduler.add(req).await.unwrap();
    store
        .update_row(&id, &fdl::TaskPatch::status(DownloadStatus::Downloading))
        .unwrap();

    let restarted = scheduler_with(store.clone(), test_config());
    assert_eq!(restarted.load_from_store().unwrap(), 1);
    assert_eq!(status_of(&restarted, &id), Some(DownloadStatus::Paused));
    assert_eq!(store.rows().unwrap()[0].status, DownloadStatus::Paused);
}

#[tokio::test]
async fn add_names_and_categorises_from_the_probe() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/dl"))
        .respond_with(
            ResponseTemplate::new(200)
                .append_header("Content-Length", "2048")
                .append_header("Content-Disposition", "attachment; filename=\"song.mp3\""),
        )
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        download_dir: dir.path().to_path_buf(),
        ..test_config()
    };
    let scheduler = scheduler_with(Arc::new(JsonStore::in_memory()), config);

    let mut first = AddRequest::new(format!("{}/dl", server.uri()));
    first.auto_start = false;
    let mut second = first.clone();
    second.connections = Some(3);

    let a = scheduler.add(first).await.unwrap();
    let b = scheduler.add(second).await.unwrap();
    let a = scheduler.task(&a).unwrap();
    let b = scheduler.task(&b).unwrap();

    assert_eq!(a.id.len(), 16);
    assert_eq!(a.filename, "song.mp3");
    assert_eq!(a.category, "Music");
    assert_eq!(a.total_size, 2048);
    assert_eq!(a.connections, 8);
    assert_eq!(a.filepath, dir.path().join("Music").join("song.mp3"));
    assert_eq!(b.filepath, dir.path().join("Music").join("song (1).mp3"));
    assert_eq!(b.connections, 3);
}

#[tokio::test]
async fn pause_parks_a_queued_task_and_resume_runs_it() {
    let server = MockServer::start().await;
    let body = pattern(3_000);
    mount_file(&server, "/q.bin", &body, Duration::ZERO).await;
    let scheduler = scheduler_with(Arc::new(JsonStore::in_memory()), test_config());
    let dir = TempDir::new().unwrap();

    let mut req = request(&server, "/q.bin", &dir);
    req.auto_start = false;
    let id = scheduler.add(req).await.unwrap();

    scheduler.pause(&id).unwrap();
    assert_eq!(status_of(&scheduler, &id), Some(DownloadStatus::Paused));
    scheduler.admit();
    assert_eq!(status_of(&scheduler, &id), Some(DownloadStatus::Paused));

    scheduler.resume(&id).unwrap();
    assert!(
        wait_for(Duration::from_secs(10), || {
            status_of(&scheduler, &id) == Some(DownloadStatus::Completed)
        })
        .await
    );
    assert_eq!(std::fs::read(dir.path().join("q.bin")).unwrap(), body);
}

#[tokio::test]
async fn failed_tasks_stay_failed_until_started_again() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let config = EngineConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
        },
        ..test_config()
    };
    let store = Arc::new(JsonStore::in_memory());
    let scheduler = scheduler_with(store.clone(), config);
    let dir = TempDir::new().unwrap();
    let id = scheduler.add(request(&server, "/gone.bin", &dir)).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            status_of(&scheduler, &id) == Some(DownloadStatus::Error)
        })
        .await
    );
    let task = scheduler.task(&id).unwrap();
    assert!(task.error_message.contains("404"), "{}", task.error_message);
    assert_eq!(store.rows().unwrap()[0].status, DownloadStatus::Error);

    scheduler.admit();
    scheduler.start_all();
    assert_eq!(status_of(&scheduler, &id), Some(DownloadStatus::Error));

    scheduler.start(&id).unwrap();
    let status = status_of(&scheduler, &id);
    assert!(
        matches!(status, Some(DownloadStatus::Downloading) | Some(DownloadStatus::Error)),
        "{status:?}"
    );
}

#[tokio::test]
async fn remove_cancels_and_deletes_partial_files() {
    let server = MockServer::start().await;
    let body = pattern(8_000);
    mount_file(&server, "/big.bin", &body, Duration::from_secs(30)).await;
    let store = Arc::new(JsonStore::in_memory());
    let scheduler = scheduler_with(store.clone(), test_config());
    let dir = TempDir::new().unwrap();

    let id = scheduler.add(request(&server, "/big.bin", &dir)).await.unwrap();
    let target = dir.path().join("big.bin");
    let state_path = state::state_path(&target);
    assert!(wait_for(Duration::from_secs(5), || state_path.exists()).await);

    tokio::time::timeout(Duration::from_secs(5), scheduler.remove(&id, true))
        .await
        .expect("remove should not hang")
        .unwrap();

    assert!(scheduler.task(&id).is_none());
    assert!(store.rows().unwrap().is_empty());
    assert!(!state_path.exists());
    assert!(!state::temp_dir(&target).exists());
    assert!(scheduler.is_idle());
}

#[tokio::test]
async fn stop_then_start_resumes_from_saved_chunks() {
    let server = MockServer::start().await;
    let body = pattern(6_000);
    mount_head(&server, "/s.bin", body.len(), true).await;
    // The first two range requests hang; later ones are served at once.
    Mock::given(method("GET"))
        .and(path("/s.bin"))
        .respond_with(RangeResponder::new(body.clone()).delayed(Duration::from_secs(30)))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/s.bin"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let scheduler = scheduler_with(Arc::new(JsonStore::in_memory()), test_config());
    let dir = TempDir::new().unwrap();
    let id = scheduler.add(request(&server, "/s.bin", &dir)).await.unwrap();
    let target = dir.path().join("s.bin");
    let state_path = state::state_path(&target);
    assert!(wait_for(Duration::from_secs(5), || state_path.exists()).await);

    scheduler.stop(&id).unwrap();
    assert_eq!(status_of(&scheduler, &id), Some(DownloadStatus::Stopped));
    assert!(wait_for(Duration::from_secs(5), || scheduler.is_idle()).await);
    assert!(state_path.exists());

    scheduler.start(&id).unwrap();
    assert!(
        wait_for(Duration::from_secs(10), || {
            status_of(&scheduler, &id) == Some(DownloadStatus::Completed)
        })
        .await
    );
    assert_eq!(std::fs::read(&target).unwrap(), body);
    assert!(!state_path.exists());
}

#[tokio::test]
async fn resume_continues_the_paused_session_in_place() {
    let server = MockServer::start().await;
    let body = pattern(100_000);
    mount_file(&server, "/slow.bin", &body, Duration::ZERO).await;
    let scheduler = scheduler_with(Arc::new(JsonStore::in_memory()), test_config());
    let dir = TempDir::new().unwrap();

    let mut req = request(&server, "/slow.bin", &dir);
    req.speed_limit = 25_000;
    let id = scheduler.add(req).await.unwrap();
    assert!(
        wait_for(Duration::from_secs(10), || {
            scheduler.task(&id).is_some_and(|t| t.downloaded > 0)
        })
        .await
    );

    scheduler.pause(&id).unwrap();
    assert_eq!(status_of(&scheduler, &id), Some(DownloadStatus::Paused));
    tokio::time::sleep(Duration::from_millis(300)).await;

    scheduler.resume(&id).unwrap();
    assert_eq!(status_of(&scheduler, &id), Some(DownloadStatus::Downloading));
    assert!(
        wait_for(Duration::from_secs(20), || {
            status_of(&scheduler, &id) == Some(DownloadStatus::Completed)
        })
        .await
    );
    assert_eq!(std::fs::read(dir.path().join("slow.bin")).unwrap(), body);
    // Same session throughout: one range request per connection.
    assert_eq!(range_headers(&server).await.len(), 2);
}

#[tokio::test]
async fn pausing_hands_the_slot_to_the_next_task() {
    let server = MockServer::start().await;
    let body = pattern(2_000);
    for file in ["/one.bin", "/two.bin"] {
        mount_file(&server, file, &body, Duration::from_secs(30)).await;
    }
    let store = Arc::new(JsonStore::in_memory());
    store.set_setting(SETTING_MAX_CONCURRENT, "1").unwrap();
    let scheduler = scheduler_with(store, test_config());
    let dir = TempDir::new().unwrap();

    let one = scheduler.add(request(&server, "/one.bin", &dir)).await.unwrap();
    let two = scheduler.add(request(&server, "/two.bin", &dir)).await.unwrap();
    assert_eq!(status_of(&scheduler, &one), Some(DownloadStatus::Downloading));
    assert_eq!(status_of(&scheduler, &two), Some(DownloadStatus::Queued));

    scheduler.pause(&one).unwrap();
    assert_eq!(status_of(&scheduler, &one), Some(DownloadStatus::Paused));
    assert_eq!(status_of(&scheduler, &two), Some(DownloadStatus::Downloading));

    tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
        .await
        .expect("shutdown should not hang");
}

#[tokio::test]
async fn pause_parks_a_task_whose_last_run_is_winding_down() {
    let server = MockServer::start().await;
    let body = pattern(6_000);
    mount_head(&server, "/w.bin", body.len(), true).await;
    Mock::given(method("GET"))
        .and(path("/w.bin"))
        .respond_with(RangeResponder::new(body.clone()).delayed(Duration::from_secs(30)))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/w.bin"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let scheduler = scheduler_with(Arc::new(JsonStore::in_memory()), test_config());
    let dir = TempDir::new().unwrap();
    let id = scheduler.add(request(&server, "/w.bin", &dir)).await.unwrap();
    let target = dir.path().join("w.bin");
    assert!(wait_for(Duration::from_secs(5), || state::state_path(&target).exists()).await);

    // No await in between: the stopped run cannot have exited yet.
    scheduler.stop(&id).unwrap();
    scheduler.start(&id).unwrap();
    assert_eq!(status_of(&scheduler, &id), Some(DownloadStatus::Queued));
    scheduler.pause(&id).unwrap();
    assert_eq!(status_of(&scheduler, &id), Some(DownloadStatus::Paused));

    assert!(wait_for(Duration::from_secs(5), || scheduler.is_idle()).await);
    assert_eq!(status_of(&scheduler, &id), Some(DownloadStatus::Paused));

    scheduler.resume(&id).unwrap();
    assert!(
        wait_for(Duration::from_secs(10), || {
            status_of(&scheduler, &id) == Some(DownloadStatus::Completed)
        })
        .await
    );
    assert_eq!(std::fs::read(&target).unwrap(), body);
}

#[tokio::test]
async fn background_loop_admits_and_records_progress() {
    let server = MockServer::start().await;
    let body = pattern(100_000);
    mount_file(&server, "/tick.bin", &body, Duration::ZERO).await;
    let store = Arc::new(JsonStore::in_memory());
    let scheduler = scheduler_with(store.clone(), test_config());
    let dir = TempDir::new().unwrap();

    let mut req = request(&server, "/tick.bin", &dir);
    req.auto_start = false;
    req.speed_limit = 25_000;
    let id = scheduler.add(req).await.unwrap();
    assert_eq!(status_of(&scheduler, &id), Some(DownloadStatus::Queued));

    let ticker = scheduler.spawn_loop();
    // Only the periodic snapshot writes byte counts of a running task.
    assert!(
        wait_for(Duration::from_secs(10), || {
            let rows = store.rows().unwrap();
            rows[0].status == DownloadStatus::Downloading && rows[0].downloaded > 0
        })
        .await
    );
    assert!(
        wait_for(Duration::from_secs(20), || {
            status_of(&scheduler, &id) == Some(DownloadStatus::Completed)
        })
        .await
    );

    scheduler.shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), ticker)
        .await
        .expect("loop should exit on shutdown")
        .unwrap();
    assert_eq!(store.rows().unwrap()[0].downloaded, body.len() as u64);
}
