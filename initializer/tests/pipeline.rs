use std::{io, net::TcpListener, sync::Arc, time::Duration};

use futures::future;
use initializer::{
    Accelerator, BackendKind, Configuration, InitErr, Initializer, MODEL_PARALLEL_RNG,
    ProcessGroup, ResumeService, ResumeState,
};
use parking_lot::Mutex;
use rand::Rng;

struct MockAccelerator {
    devices: usize,
    current: Option<usize>,
}

impl MockAccelerator {
    fn new(devices: usize) -> Self {
        Self {
            devices,
            current: None,
        }
    }
}

impl Accelerator for MockAccelerator {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn bind(&mut self, device: usize) -> io::Result<()> {
        self.current = Some(device);
        Ok(())
    }

    fn current_device(&self) -> Option<usize> {
        self.current
    }

    fn diagnostics(&self) -> String {
        "mock".into()
    }
}

type Log = Arc<Mutex<Vec<(usize, &'static str)>>>;

struct LoggedResume {
    rank: usize,
    log: Log,
}

impl ResumeService for LoggedResume {
    fn init(&mut self) -> io::Result<()> {
        self.log.lock().push((self.rank, "init"));
        Ok(())
    }

    fn termination_requested(&self) -> bool {
        false
    }

    fn request_resume(&mut self) {}
}

fn free_port() -> u16 {
    let list = TcpListener::bind("127.0.0.1:0").unwrap();
    list.local_addr().unwrap().port()
}

fn worker_config(
    rank: usize,
    world_size: usize,
    model_parallel_size: usize,
    port: u16,
) -> Configuration {
    Configuration {
        rank,
        world_size,
        model_parallel_size,
        master_addr: "127.0.0.1".into(),
        master_port: port,
        distributed_backend: BackendKind::Gloo,
        rendezvous_timeout_ms: 10_000,
        seed: Some(1234),
        ..Default::default()
    }
}

struct Outcome {
    rank: usize,
    model_parallel_rank: usize,
    data_parallel_rank: usize,
    model_parallel_ranks: Vec<usize>,
    data_parallel_ranks: Vec<usize>,
    global_draw: u64,
    model_parallel_draw: u64,
}

fn members(group: Option<&ProcessGroup>) -> Vec<usize> {
    group.map(|g| g.ranks().to_vec()).unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn four_workers_agree_on_the_topology() {
    const WORLD: usize = 4;
    const MP: usize = 2;

    let port = free_port();
    let workers = (0..WORLD).map(|rank| {
        tokio::spawn(async move {
            let cfg = worker_config(rank, WORLD, MP, port);
            let mut init = Initializer::new(cfg, MockAccelerator::new(2));
            let mut done = init.initialize().await?;

            let topology = &done.topology;
            let outcome = Outcome {
                rank: done.context.rank,
                model_parallel_rank: topology.model_parallel_rank(),
                data_parallel_rank: topology.data_parallel_rank(),
                model_parallel_ranks: members(topology.model_parallel_group()),
                data_parallel_ranks: members(topology.data_parallel_group()),
                global_draw: done.seeds.global().random(),
                model_parallel_draw: done
                    .seeds
                    .tracker()
                    .fork(MODEL_PARALLEL_RNG, |rng| rng.random())?,
            };

            init.shutdown().await?;
            Ok::<_, InitErr>(outcome)
        })
    });

    let mut outcomes: Vec<Outcome> = future::join_all(workers)
        .await
        .into_iter()
        .map(|res| res.unwrap().unwrap())
        .collect();
    outcomes.sort_by_key(|o| o.rank);

    for o in &outcomes {
        assert_eq!(o.model_parallel_rank, o.rank % MP);
        assert_eq!(o.data_parallel_rank, o.rank / MP);
        assert!(o.model_parallel_ranks.contains(&o.rank));
        assert!(o.data_parallel_ranks.contains(&o.rank));
        assert_eq!(o.global_draw, outcomes[0].global_draw);
    }

    assert_eq!(outcomes[0].model_parallel_ranks, vec![0, 1]);
    assert_eq!(outcomes[3].model_parallel_ranks, vec![2, 3]);
    assert_eq!(outcomes[0].data_parallel_ranks, vec![0, 2]);
    assert_eq!(outcomes[1].data_parallel_ranks, vec![1, 3]);

    let draws: Vec<_> = outcomes.iter().map(|o| o.model_parallel_draw).collect();
    assert_eq!(draws[1], draws[3]);
    assert_ne!(draws[0], draws[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_worker_is_ready_before_every_resume_init() {
    const WORLD: usize = 4;

    let port = free_port();
    let log = Log::default();

    let workers = (0..WORLD).map(|rank| {
        let log = Arc::clone(&log);

        tokio::spawn(async move {
            // Stagger arrivals so a missing barrier would show up in the log order.
            tokio::time::sleep(Duration::from_millis(50 * rank as u64)).await;

            let cfg = worker_config(rank, WORLD, 1, port);
            let service = LoggedResume {
                rank,
                log: Arc::clone(&log),
            };

            let mut init = Initializer::new(cfg, MockAccelerator::new(1))
                .with_resume(Box::new(service));
            let done = init.initialize().await?;

            log.lock().push((rank, "ready"));
            init.shutdown().await?;
            Ok::<_, InitErr>(done.resume)
        })
    });

    for res in future::join_all(workers).await {
        assert_eq!(res.unwrap().unwrap(), ResumeState::Ready);
    }

    let log = log.lock();
    let first_ready = log.iter().position(|(_, step)| *step == "ready").unwrap();
    let inits = log.iter().filter(|(_, step)| *step == "init").count();

    assert_eq!(inits, WORLD);
    assert!(log[..first_ready].iter().all(|(_, step)| *step == "init"));
    assert_eq!(first_ready, WORLD);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn degraded_workers_skip_model_parallel_groups() {
    const WORLD: usize = 2;

    let port = free_port();
    let workers = (0..WORLD).map(|rank| {
        tokio::spawn(async move {
            let mut cfg = worker_config(rank, WORLD, 2, port);
            cfg.require_accelerator = false;

            let mut init = Initializer::new(cfg, MockAccelerator::new(0));
            let done = init.initialize().await?;
            init.shutdown().await?;
            Ok::<_, InitErr>(done)
        })
    });

    for res in future::join_all(workers).await {
        let done = res.unwrap().unwrap();

        assert_eq!(done.context.device, None);
        assert!(!done.topology.is_model_parallel());
        assert!(done.topology.model_parallel_group().is_none());
        assert!(!done.seeds.is_model_parallel());
    }
}
