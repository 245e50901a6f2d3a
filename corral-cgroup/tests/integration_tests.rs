use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use corral_cgroup::*;
use corral_core::*;
use corral_resource::{NotificationCallback, NotifierConfig};
use tokio::sync::mpsc;

fn config() -> FactoryConfig {
    FactoryConfig::default()
        .with_notifier(NotifierConfig::default().with_poll_interval(Duration::from_millis(5)))
}

/// Fresh machine with every hierarchy mounted through machine init
async fn machine() -> (MockCgroupFs, FactoryRegistry) {
    let fs = MockCgroupFs::new();
    let shared: Arc<dyn CgroupFs> = Arc::new(fs.clone());
    let registry = standard_registry(&shared, config()).unwrap();
    registry.init_machine(&InitSpec::standard()).await.unwrap();
    (fs, registry)
}

fn name(s: &str) -> ContainerName {
    ContainerName::new(s).unwrap()
}

fn cpu_shares(shares: u64) -> ContainerSpec {
    ContainerSpec {
        cpu: Some(CpuSpec {
            shares: Some(shares),
            max_limit: None,
        }),
        ..Default::default()
    }
}

fn recorder() -> (NotificationCallback, mpsc::UnboundedReceiver<Result<()>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: NotificationCallback = Box::new(move |status: Result<()>| {
        let _ = tx.send(status);
    });
    (callback, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Result<()>>) -> Option<Result<()>> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a notification")
}

#[tokio::test]
async fn test_cpu_create_update_destroy() {
    let (_fs, registry) = machine().await;
    let cpu = registry.get(ResourceType::Cpu).unwrap();
    let foo = name("/foo");

    let handler = cpu.create(&foo, &cpu_shares(100)).await.unwrap();
    assert_eq!(handler.container_name(), &foo);
    assert_eq!(handler.resource_type(), ResourceType::Cpu);

    let mut spec = ContainerSpec::default();
    handler.spec(&mut spec).await.unwrap();
    assert_eq!(spec.cpu.unwrap().shares, Some(100));

    handler
        .update(&cpu_shares(200), UpdatePolicy::Diff)
        .await
        .unwrap();
    let mut spec = ContainerSpec::default();
    handler.spec(&mut spec).await.unwrap();
    assert_eq!(spec.cpu.unwrap().shares, Some(200));

    handler.destroy().await.unwrap();

    let err = cpu.get(&foo).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_get_attaches_to_existing_state() {
    let (_fs, registry) = machine().await;
    let cpu = registry.get(ResourceType::Cpu).unwrap();

    let err = cpu.get(&name("/missing")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let _created = cpu.create(&name("/job"), &cpu_shares(300)).await.unwrap();
    let attached = cpu.get(&name("/job")).await.unwrap();

    let mut spec = ContainerSpec::default();
    attached.spec(&mut spec).await.unwrap();
    assert_eq!(spec.cpu.unwrap().shares, Some(300));

    // The root container always exists once the hierarchy is mounted
    assert!(cpu.get(&ContainerName::root()).await.is_ok());
}

#[tokio::test]
async fn test_diff_keeps_and_replace_resets() {
    let (_fs, registry) = machine().await;
    let memory = registry.get(ResourceType::Memory).unwrap();

    let initial = ContainerSpec {
        memory: Some(MemorySpec {
            limit: Some(MemorySize::from_mb(100)),
            reservation: Some(MemorySize::from_mb(50)),
            swap_limit: None,
        }),
        ..Default::default()
    };
    let handler = memory.create(&name("/job"), &initial).await.unwrap();

    let reservation_only = ContainerSpec {
        memory: Some(MemorySpec {
            reservation: Some(MemorySize::from_mb(80)),
            ..Default::default()
        }),
        ..Default::default()
    };

    handler
        .update(&reservation_only, UpdatePolicy::Diff)
        .await
        .unwrap();
    let mut spec = ContainerSpec::default();
    handler.spec(&mut spec).await.unwrap();
    let current = spec.memory.unwrap();
    assert_eq!(current.limit, Some(MemorySize::from_mb(100)));
    assert_eq!(current.reservation, Some(MemorySize::from_mb(80)));

    handler
        .update(&reservation_only, UpdatePolicy::Replace)
        .await
        .unwrap();
    let mut spec = ContainerSpec::default();
    handler.spec(&mut spec).await.unwrap();
    let current = spec.memory.unwrap();
    assert_eq!(current.limit, None);
    assert_eq!(current.reservation, Some(MemorySize::from_mb(80)));
}

#[tokio::test]
async fn test_init_machine_is_idempotent() {
    let (fs, registry) = machine().await;
    assert_eq!(fs.mount_calls().await, 6);

    registry.init_machine(&InitSpec::standard()).await.unwrap();
    assert_eq!(fs.mount_calls().await, 6);

    let mut relocated = InitSpec::standard();
    relocated.mounts[1].mount_path = "/cgroups/memory".into();
    let err = registry.init_machine(&relocated).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].item, "memory");
}

#[tokio::test]
async fn test_concurrent_init_converges() {
    let fs = MockCgroupFs::new();
    let shared: Arc<dyn CgroupFs> = Arc::new(fs.clone());
    let registry = Arc::new(standard_registry(&shared, config()).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry.init_machine(&InitSpec::standard()).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(fs.mount_calls().await, 6);
}

#[tokio::test]
async fn test_destroy_is_terminal() {
    let (fs, registry) = machine().await;
    let pids = registry.get(ResourceType::Global).unwrap();
    let job = name("/job");

    let handler = pids.create(&job, &ContainerSpec::default()).await.unwrap();
    handler.destroy().await.unwrap();
    assert!(!fs.has_dir("/sys/fs/cgroup/pids/job").await);

    // A second handler for the same pair finds nothing to act on
    let err = pids.get(&job).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // The name can be reused
    let again = pids.create(&job, &ContainerSpec::default()).await.unwrap();
    again.destroy().await.unwrap();
}

#[tokio::test]
async fn test_stale_handler_after_destroy() {
    let (_fs, registry) = machine().await;
    let cpu = registry.get(ResourceType::Cpu).unwrap();

    let owner = cpu.create(&name("/job"), &cpu_shares(100)).await.unwrap();
    let stale = cpu.get(&name("/job")).await.unwrap();
    owner.destroy().await.unwrap();

    let err = stale
        .update(&cpu_shares(200), UpdatePolicy::Diff)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_busy_destroy_hands_back_handler() {
    let (fs, registry) = machine().await;
    let monitoring = registry.get(ResourceType::Monitoring).unwrap();
    let tid = ThreadId::from_raw(4242);
    fs.spawn_task(tid).await;

    let handler = monitoring
        .create(&name("/job"), &ContainerSpec::default())
        .await
        .unwrap();
    handler.enter(&[tid]).await.unwrap();

    let err = handler.destroy().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    // Still fully usable
    let handler = err.into_handler();
    let mut stats = ContainerStats::default();
    handler.stats(StatsType::Summary, &mut stats).await.unwrap();
    assert_eq!(stats.monitoring.unwrap().task_count, 1);

    fs.exit_task(tid).await;
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn test_parent_with_children_cannot_be_destroyed() {
    let (_fs, registry) = machine().await;
    let diskio = registry.get(ResourceType::DiskIo).unwrap();
    let spec = ContainerSpec::default();

    let parent = diskio.create(&name("/parent"), &spec).await.unwrap();
    let child = diskio.create(&name("/parent/child"), &spec).await.unwrap();

    let parent = parent.destroy().await.unwrap_err().into_handler();
    child.destroy().await.unwrap();
    parent.destroy().await.unwrap();
}

#[tokio::test]
async fn test_enter_is_idempotent_and_reports_failures() {
    let (fs, registry) = machine().await;
    let cpu = registry.get(ResourceType::Cpu).unwrap();
    let handler = cpu.create(&name("/job"), &cpu_shares(100)).await.unwrap();

    let tid = ThreadId::from_raw(300);
    fs.spawn_task(tid).await;
    handler.enter(&[tid]).await.unwrap();
    handler.enter(&[tid]).await.unwrap();

    let tasks = fs
        .file("/sys/fs/cgroup/cpu,cpuacct/job/tasks")
        .await
        .unwrap();
    assert_eq!(tasks, "300\n");

    let err = handler
        .enter(&[ThreadId::from_raw(999_999)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.failures()[0].item, "tid 999999");
}

#[tokio::test]
async fn test_enter_moves_between_containers() {
    let (fs, registry) = machine().await;
    let memory = registry.get(ResourceType::Memory).unwrap();
    let spec = ContainerSpec::default();
    let first = memory.create(&name("/first"), &spec).await.unwrap();
    let second = memory.create(&name("/second"), &spec).await.unwrap();

    let tid = ThreadId::from_raw(77);
    fs.spawn_task(tid).await;
    first.enter(&[tid]).await.unwrap();
    second.enter(&[tid]).await.unwrap();

    // The emptied container can go
    first.destroy().await.unwrap();
    assert_eq!(
        fs.file("/sys/fs/cgroup/memory/second/tasks").await.unwrap(),
        "77\n"
    );
}

#[tokio::test]
async fn test_handlers_touch_only_their_section() {
    let (_fs, registry) = machine().await;
    let memory = registry
        .get(ResourceType::Memory)
        .unwrap()
        .create(&name("/job"), &ContainerSpec::default())
        .await
        .unwrap();

    let foreign_cpu = CpuStats {
        throttled_periods: 42,
        ..Default::default()
    };
    let mut stats = ContainerStats {
        cpu: Some(foreign_cpu.clone()),
        ..Default::default()
    };
    memory.stats(StatsType::Full, &mut stats).await.unwrap();
    assert_eq!(stats.cpu, Some(foreign_cpu));
    assert!(stats.memory.is_some());
    assert!(stats.diskio.is_none());

    let mut spec = cpu_shares(7);
    memory.spec(&mut spec).await.unwrap();
    assert_eq!(spec.cpu.unwrap().shares, Some(7));
    assert!(spec.memory.is_some());
    assert!(spec.global.is_none());
}

#[tokio::test]
async fn test_resources_are_independent() {
    let (fs, registry) = machine().await;
    let job = name("/job");

    let cpu = registry
        .get(ResourceType::Cpu)
        .unwrap()
        .create(&job, &cpu_shares(100))
        .await
        .unwrap();

    // No memory state yet
    let memory = registry.get(ResourceType::Memory).unwrap();
    assert_eq!(
        memory.get(&job).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );

    let memory = memory.create(&job, &ContainerSpec::default()).await.unwrap();
    memory.destroy().await.unwrap();

    assert!(fs.has_dir("/sys/fs/cgroup/cpu,cpuacct/job").await);
    let mut spec = ContainerSpec::default();
    cpu.spec(&mut spec).await.unwrap();
    assert_eq!(spec.cpu.unwrap().shares, Some(100));
}

#[tokio::test]
async fn test_threshold_notification_lifecycle() {
    let (fs, registry) = machine().await;
    let memory = registry
        .get(ResourceType::Memory)
        .unwrap()
        .create(&name("/job"), &ContainerSpec::default())
        .await
        .unwrap();
    let usage = Path::new("/sys/fs/cgroup/memory/job/memory.usage_in_bytes");

    let threshold = EventSpec {
        memory_threshold: Some(MemoryThresholdEvent {
            usage: MemorySize::from_mb(10),
        }),
        ..Default::default()
    };
    let (callback, mut rx) = recorder();
    let id = memory
        .register_notification(&threshold, callback)
        .await
        .unwrap();

    fs.set_file(usage, MemorySize::from_mb(20).as_bytes().to_string())
        .await;
    assert!(next(&mut rx).await.unwrap().is_ok());

    let (other, _other_rx) = recorder();
    let oom = EventSpec {
        oom: Some(OomEvent {}),
        ..Default::default()
    };
    let second = memory.register_notification(&oom, other).await.unwrap();
    assert_ne!(id, second);

    memory.unregister_notification(id).await.unwrap();
    let status = next(&mut rx).await.unwrap();
    assert_eq!(status.unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(next(&mut rx).await.is_none());

    let err = memory.unregister_notification(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_container_empty_notification() {
    let (fs, registry) = machine().await;
    let monitoring = registry
        .get(ResourceType::Monitoring)
        .unwrap()
        .create(&name("/job"), &ContainerSpec::default())
        .await
        .unwrap();

    let tid = ThreadId::from_raw(900);
    fs.spawn_task(tid).await;
    monitoring.enter(&[tid]).await.unwrap();

    let empty = EventSpec {
        container_empty: Some(ContainerEmptyEvent {}),
        ..Default::default()
    };
    let (callback, mut rx) = recorder();
    monitoring
        .register_notification(&empty, callback)
        .await
        .unwrap();

    fs.exit_task(tid).await;
    assert!(next(&mut rx).await.unwrap().is_ok());

    monitoring.destroy().await.unwrap();
    let status = next(&mut rx).await.unwrap();
    assert_eq!(status.unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_concurrent_handlers() {
    let (_fs, registry) = machine().await;
    let cpu = registry.get(ResourceType::Cpu).unwrap();

    let mut tasks = Vec::new();
    for i in 0..16u64 {
        let cpu = Arc::clone(&cpu);
        tasks.push(tokio::spawn(async move {
            let job = ContainerName::new(format!("/job-{i}")).unwrap();
            let handler = cpu.create(&job, &cpu_shares(100 + i)).await?;
            let mut spec = ContainerSpec::default();
            handler.spec(&mut spec).await?;
            assert_eq!(spec.cpu.unwrap().shares, Some(100 + i));
            handler.destroy().await?;
            Ok::<_, Error>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Many callers on one handler
    let shared: Arc<dyn ResourceHandler> =
        Arc::from(cpu.create(&name("/shared"), &cpu_shares(100)).await.unwrap());
    let mut readers = Vec::new();
    for _ in 0..16 {
        let shared = Arc::clone(&shared);
        readers.push(tokio::spawn(async move {
            let mut stats = ContainerStats::default();
            shared.stats(StatsType::Summary, &mut stats).await?;
            shared.update(&cpu_shares(500), UpdatePolicy::Diff).await
        }));
    }
    for reader in readers {
        reader.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_host_mount_table_is_readable() {
    if !Path::new("/proc/self/mounts").exists() {
        println!("Skipping: no /proc on this machine");
        return;
    }

    let host = HostCgroupFs::new();
    let mounts = host.mounts().await.unwrap();
    for mount in mounts {
        assert!(!mount.hierarchies.is_empty());
    }
}
