//! End-to-end lifecycle tests for the module loader.
//!
//! These drive real modules from a built-in unit through loading, the
//! post-load and pre-unload stages, and teardown, checking ordering, batch
//! unwinding and the reference-count rules on the way.

use module_system::contracts::{Auth, AuthCompletion, AuthFailure, AuthOutcome, KillContext, KillPoints, KillReward, LoginRequest};
use module_system::*;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

/// Routes loader logs through the test harness; `RUST_LOG=debug` shows the
/// state transitions of a failing test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

trait Network: Send + Sync {
    fn port(&self) -> u16;
}

impl Capability for dyn Network {
    const ID: CapabilityId = CapabilityId::new("test-network");
}

trait Relay: Send + Sync {
    fn relay(&self, message: &str) -> String;
}

impl Capability for dyn Relay {
    const ID: CapabilityId = CapabilityId::new("test-relay");
}

struct Udp(u16);

impl Network for Udp {
    fn port(&self) -> u16 {
        self.0
    }
}

struct Echo;

impl Relay for Echo {
    fn relay(&self, message: &str) -> String {
        message.to_string()
    }
}

struct DenyAll;

impl Auth for DenyAll {
    fn authenticate(&self, _request: LoginRequest, completion: AuthCompletion) {
        completion.complete(AuthOutcome::Failed(AuthFailure::BadPassword));
    }
}

struct Flat(i32);

impl KillPoints for Flat {
    fn kill_points(&self, _kill: &KillContext) -> KillReward {
        KillReward {
            points: self.0,
            prize: None,
        }
    }
}

/// Records lifecycle events from every test module.
#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn record(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    /// Module names of every event of `kind`, in order.
    fn events(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{}:", kind);
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| event.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

type LoadFn = Arc<dyn Fn(&ModuleContext) -> Result<(), ModuleError> + Send + Sync>;

struct TestModule {
    name: &'static str,
    journal: Journal,
    on_load: LoadFn,
    fail_post_load: bool,
}

#[async_trait]
impl Module for TestModule {
    fn name(&self) -> &str {
        self.name
    }

    async fn load(&mut self, ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        self.journal.record(format!("load:{}", self.name));
        (*self.on_load)(ctx.as_ref())
    }

    async fn post_load(&mut self, _ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        self.journal.record(format!("post_load:{}", self.name));
        if self.fail_post_load {
            return Err(ModuleError::ExecutionError("post-load refused".to_string()));
        }
        Ok(())
    }

    async fn pre_unload(&mut self, _ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        self.journal.record(format!("pre_unload:{}", self.name));
        Ok(())
    }

    async fn unload(&mut self, _ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        self.journal.record(format!("unload:{}", self.name));
        Ok(())
    }
}

fn test_module<F>(
    journal: &Journal,
    name: &'static str,
    fail_post_load: bool,
    on_load: F,
) -> FnFactory<impl Fn() -> Box<dyn Module> + Send + Sync>
where
    F: Fn(&ModuleContext) -> Result<(), ModuleError> + Send + Sync + 'static,
{
    let journal = journal.clone();
    let on_load: LoadFn = Arc::new(on_load);
    FnFactory::new(name, move || {
        journal.record(format!("create:{}", name));
        Box::new(TestModule {
            name,
            journal: journal.clone(),
            on_load: Arc::clone(&on_load),
            fail_post_load,
        }) as Box<dyn Module>
    })
}

fn plain(journal: &Journal, name: &'static str) -> FnFactory<impl Fn() -> Box<dyn Module> + Send + Sync> {
    test_module(journal, name, false, |_| Ok(()))
}

/// Holds the network interface from post-load until pre-unload.
struct Consumer {
    held: Option<InterfaceRef<dyn Network>>,
}

#[async_trait]
impl Module for Consumer {
    fn name(&self) -> &str {
        "consumer"
    }

    async fn load(&mut self, _ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        Ok(())
    }

    async fn post_load(&mut self, ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        self.held = Some(ctx.get_interface::<dyn Network>()?);
        Ok(())
    }

    async fn pre_unload(&mut self, _ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        if let Some(network) = self.held.take() {
            network.release()?;
        }
        Ok(())
    }
}

/// Blocks its load hook until told to proceed.
struct Gate {
    started: Arc<Notify>,
    proceed: Arc<Notify>,
}

#[async_trait]
impl Module for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    async fn load(&mut self, _ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        self.started.notify_one();
        self.proceed.notified().await;
        Ok(())
    }
}

/// The standard unit: network, auth, chatnet and relay.
fn zone_unit(journal: &Journal) -> StaticUnit {
    StaticUnit::new("zone")
        .with_factory(test_module(journal, "network", false, |ctx| {
            ctx.register_interface::<dyn Network>(Arc::new(Udp(5000)))?;
            Ok(())
        }))
        .with_factory(test_module(journal, "auth", false, |ctx| {
            ctx.register_interface::<dyn Auth>(Arc::new(DenyAll))?;
            Ok(())
        }))
        .with_factory(test_module(journal, "chatnet", false, |ctx| {
            ctx.get_interface::<dyn Network>()?.release()?;
            Ok(())
        }))
        .with_factory(test_module(journal, "relay", false, |ctx| {
            ctx.register_interface::<dyn Relay>(Arc::new(Echo))?;
            Ok(())
        }))
        .with_factory(test_module(journal, "squatter", false, |ctx| {
            ctx.register_interface::<dyn Auth>(Arc::new(DenyAll))?;
            Ok(())
        }))
}

fn loader_for(unit: StaticUnit) -> (Arc<Broker>, ModuleLoader) {
    init_tracing();
    let broker = Arc::new(Broker::new());
    let loader = ModuleLoader::new(Arc::clone(&broker), Arc::new(UnitResolver::new(unit)));
    (broker, loader)
}

const ZONE_CONFIG: &str = r#"
[[modules]]
name = "network"

[[modules]]
name = "auth"

[[modules]]
name = "chatnet"
depends_on = ["network"]
"#;

#[tokio::test]
async fn test_load_order_follows_dependencies() {
    let journal = Journal::default();
    let (_broker, loader) = loader_for(zone_unit(&journal));

    let loaded = loader
        .load_from_config(&ConfigSource::inline(ZONE_CONFIG))
        .await
        .unwrap();
    assert_eq!(loaded, vec!["network", "auth", "chatnet"]);
    assert_eq!(journal.events("load"), loaded);

    // Same configuration, fresh loader: same order.
    let (_broker, again) = loader_for(zone_unit(&Journal::default()));
    let reloaded = again
        .load_from_config(&ConfigSource::inline(ZONE_CONFIG))
        .await
        .unwrap();
    assert_eq!(reloaded, loaded);
}

#[tokio::test]
async fn test_dependent_never_precedes_dependency() {
    let journal = Journal::default();
    let (_broker, loader) = loader_for(zone_unit(&journal));

    let loaded = loader
        .load_from_config(&ConfigSource::inline(
            r#"
            [[modules]]
            name = "chatnet"
            depends_on = ["network"]
            [[modules]]
            name = "auth"
            [[modules]]
            name = "network"
            "#,
        ))
        .await
        .unwrap();
    assert_eq!(loaded, vec!["auth", "network", "chatnet"]);
}

#[tokio::test]
async fn test_failed_registration_unwinds_batch() {
    let journal = Journal::default();
    let (broker, loader) = loader_for(zone_unit(&journal));

    // An earlier batch already provides the auth capability.
    loader.add_module(None, "squatter").await.unwrap();

    let err = loader
        .load_from_config(&ConfigSource::inline(ZONE_CONFIG))
        .await
        .unwrap_err();
    match err {
        LoaderError::Load { module, source } => {
            assert_eq!(module, "auth");
            assert!(matches!(
                source,
                ModuleError::Registry(RegistryError::Duplicate { ref owner, .. }) if owner == "squatter"
            ));
        }
        other => panic!("unexpected error: {}", other),
    }

    // Network was unwound, chatnet never attempted, the earlier batch kept.
    assert!(matches!(
        broker.get_interface::<dyn Network>(),
        Err(RegistryError::NotFound(_))
    ));
    assert!(!journal.events("create").contains(&"chatnet".to_string()));
    assert_eq!(loader.loaded_modules().await, vec!["squatter"]);
    assert_eq!(
        broker.interfaces().owner_of(<dyn Auth as Capability>::ID),
        Some("squatter".to_string())
    );
}

#[tokio::test]
async fn test_panicking_load_is_unwound() {
    let journal = Journal::default();
    let unit = zone_unit(&journal).with_factory(test_module(&journal, "faulty", false, |ctx| {
        ctx.register_interface::<dyn Relay>(Arc::new(Echo))?;
        panic!("arena table corrupted");
    }));
    let (broker, loader) = loader_for(unit);

    let err = loader
        .load_from_config(&ConfigSource::inline(
            "[[modules]]\nname = \"network\"\n[[modules]]\nname = \"faulty\"\n",
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LoaderError::Load { ref module, source: ModuleError::Panicked(ref message) }
            if module == "faulty" && message == "arena table corrupted"
    ));
    assert!(broker.interfaces().is_empty());
    assert!(loader.modules().await.is_empty());
}

#[tokio::test]
async fn test_unload_refused_while_referenced() {
    let journal = Journal::default();
    let (broker, loader) = loader_for(zone_unit(&journal));
    loader.add_module(None, "network").await.unwrap();
    loader.do_post_load_stage().await.unwrap();

    let network_id = <dyn Network as Capability>::ID;
    let first = broker.get_interface::<dyn Network>().unwrap();
    assert_eq!(first.port(), 5000);
    assert_eq!(broker.interfaces().outstanding_of(network_id), Some(1));
    first.release().unwrap();
    assert_eq!(broker.interfaces().outstanding_of(network_id), Some(0));

    let second = broker.get_interface::<dyn Network>().unwrap();
    let err = loader.unload_module("network").await.unwrap_err();
    assert!(err.is_busy());
    assert!(matches!(err, LoaderError::Busy { refs: 1, .. }));

    // A refused unload changes nothing: no hook ran, the state is kept and
    // the interface is still published.
    assert_eq!(
        loader.module_state("network").await,
        Some(ModuleState::PostLoaded)
    );
    assert!(journal.events("pre_unload").is_empty());
    assert_eq!(second.port(), 5000);
    broker.get_interface::<dyn Network>().unwrap().release().unwrap();
    assert_eq!(broker.interfaces().outstanding_of(network_id), Some(1));

    second.release().unwrap();
    loader.unload_module("network").await.unwrap();
    assert!(matches!(
        broker.get_interface::<dyn Network>(),
        Err(RegistryError::NotFound(_))
    ));
    assert_eq!(journal.events("pre_unload"), vec!["network"]);
    assert_eq!(journal.events("unload"), vec!["network"]);
}

#[tokio::test]
async fn test_advisors_ordered_by_priority() {
    let journal = Journal::default();
    let unit = StaticUnit::new("scoring")
        .with_factory(test_module(&journal, "bounty", false, |ctx| {
            ctx.register_advisor::<dyn KillPoints>(Arc::new(Flat(10)), 10);
            Ok(())
        }))
        .with_factory(test_module(&journal, "bonus", false, |ctx| {
            ctx.register_advisor::<dyn KillPoints>(Arc::new(Flat(5)), 5);
            Ok(())
        }));
    let (broker, loader) = loader_for(unit);
    loader
        .load_from_config(&ConfigSource::inline(
            "[[modules]]\nname = \"bounty\"\n[[modules]]\nname = \"bonus\"\n",
        ))
        .await
        .unwrap();

    let advisors = broker.get_advisors::<dyn KillPoints>().unwrap();
    let seen: Vec<(i32, String)> = advisors
        .entries()
        .map(|(priority, owner, _)| (priority, owner.to_string()))
        .collect();
    assert_eq!(seen, vec![(5, "bonus".to_string()), (10, "bounty".to_string())]);

    // Unload waits for the snapshot.
    assert!(matches!(
        loader.unload_all().await,
        Err(LoaderError::Busy { .. })
    ));
    drop(advisors);
    assert_eq!(loader.unload_all().await.unwrap(), vec!["bonus", "bounty"]);
    assert!(broker.advisors().is_empty());
}

#[tokio::test]
async fn test_stage_hooks_run_in_order() {
    let journal = Journal::default();
    let unit = StaticUnit::new("chain")
        .with_factory(plain(&journal, "a"))
        .with_factory(plain(&journal, "b").depends_on(["a"]))
        .with_factory(plain(&journal, "c").depends_on(["b"]));
    let (_broker, loader) = loader_for(unit);

    loader
        .load_from_config(&ConfigSource::inline(
            "[[modules]]\nname = \"c\"\n[[modules]]\nname = \"b\"\n[[modules]]\nname = \"a\"\n",
        ))
        .await
        .unwrap();
    assert_eq!(loader.do_post_load_stage().await.unwrap(), 3);
    assert_eq!(loader.do_pre_unload_stage().await.unwrap(), 3);
    assert_eq!(loader.unload_all().await.unwrap(), vec!["c", "b", "a"]);

    assert_eq!(journal.events("load"), vec!["a", "b", "c"]);
    assert_eq!(journal.events("post_load"), vec!["a", "b", "c"]);
    assert_eq!(journal.events("pre_unload"), vec!["c", "b", "a"]);
    assert_eq!(journal.events("unload"), vec!["c", "b", "a"]);
}

#[tokio::test]
async fn test_failed_post_load_still_advances() {
    let journal = Journal::default();
    let unit = StaticUnit::new("grumpy").with_factory(test_module(&journal, "grumpy", true, |_| Ok(())));
    let (_broker, loader) = loader_for(unit);
    loader.add_module(None, "grumpy").await.unwrap();

    assert_eq!(loader.do_post_load_stage().await.unwrap(), 1);
    assert_eq!(
        loader.module_state("grumpy").await,
        Some(ModuleState::PostLoaded)
    );
    assert_eq!(loader.do_post_load_stage().await.unwrap(), 0);
    assert_eq!(journal.events("post_load"), vec!["grumpy"]);
}

#[tokio::test]
async fn test_busy_unload_all_changes_nothing() {
    let journal = Journal::default();
    let (broker, loader) = loader_for(zone_unit(&journal));
    loader
        .load_from_config(&ConfigSource::inline(
            "[[modules]]\nname = \"network\"\n[[modules]]\nname = \"relay\"\n",
        ))
        .await
        .unwrap();

    let held = broker.get_interface::<dyn Network>().unwrap();
    match loader.unload_all().await {
        Err(LoaderError::Busy {
            module,
            capability,
            refs,
        }) => {
            assert_eq!(module, "network");
            assert_eq!(capability, <dyn Network as Capability>::ID);
            assert_eq!(refs, 1);
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // The relay was retired before the refusal and must be visible again.
    assert_eq!(loader.loaded_modules().await, vec!["network", "relay"]);
    let relay = broker.get_interface::<dyn Relay>().unwrap();
    assert_eq!(relay.relay("ping"), "ping");
    drop(relay);
    assert!(journal.events("unload").is_empty());

    drop(held);
    assert_eq!(loader.unload_all().await.unwrap(), vec!["relay", "network"]);
}

#[tokio::test]
async fn test_consumer_reference_released_by_pre_unload() {
    let journal = Journal::default();
    let unit = zone_unit(&journal).with_factory(
        FnFactory::new("consumer", || Box::new(Consumer { held: None }) as Box<dyn Module>)
            .depends_on(["network"]),
    );
    let (broker, loader) = loader_for(unit);
    loader
        .load_from_config(&ConfigSource::inline(
            "[[modules]]\nname = \"consumer\"\n[[modules]]\nname = \"network\"\n",
        ))
        .await
        .unwrap();
    loader.do_post_load_stage().await.unwrap();

    let network_id = <dyn Network as Capability>::ID;
    assert_eq!(broker.interfaces().outstanding_of(network_id), Some(1));
    assert!(matches!(
        loader.unload_module("network").await,
        Err(LoaderError::HasDependents { .. })
    ));

    // The consumer lets go of the network in its pre-unload hook.
    assert_eq!(loader.do_pre_unload_stage().await.unwrap(), 2);
    assert_eq!(broker.interfaces().outstanding_of(network_id), Some(0));
    assert_eq!(
        loader.unload_all().await.unwrap(),
        vec!["consumer", "network"]
    );
}

#[tokio::test]
async fn test_unload_all_requires_pre_unload_stage() {
    let journal = Journal::default();
    let (broker, loader) = loader_for(zone_unit(&journal));
    loader
        .load_from_config(&ConfigSource::inline(
            "[[modules]]\nname = \"network\"\n[[modules]]\nname = \"relay\"\n",
        ))
        .await
        .unwrap();
    loader.do_post_load_stage().await.unwrap();

    match loader.unload_all().await {
        Err(LoaderError::InvalidTransition { module, from, to }) => {
            assert_eq!(module, "relay");
            assert_eq!(from, ModuleState::PostLoaded);
            assert_eq!(to, ModuleState::Unloaded);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(journal.events("pre_unload").is_empty());
    assert!(journal.events("unload").is_empty());
    assert_eq!(
        loader.module_state("network").await,
        Some(ModuleState::PostLoaded)
    );
    broker.get_interface::<dyn Relay>().unwrap().release().unwrap();

    // A busy refusal after the stage leaves every module pre-unloaded.
    loader.do_pre_unload_stage().await.unwrap();
    let held = broker.get_interface::<dyn Network>().unwrap();
    assert!(loader.unload_all().await.unwrap_err().is_busy());
    assert_eq!(
        loader.module_state("relay").await,
        Some(ModuleState::PreUnloaded)
    );
    assert_eq!(journal.events("pre_unload"), vec!["relay", "network"]);

    drop(held);
    assert_eq!(loader.unload_all().await.unwrap(), vec!["relay", "network"]);
}

#[tokio::test]
async fn test_unload_before_post_load_skips_stage_hooks() {
    let journal = Journal::default();
    let (broker, loader) = loader_for(zone_unit(&journal));
    loader.add_module(None, "network").await.unwrap();
    assert_eq!(loader.module_state("network").await, Some(ModuleState::Loaded));

    loader.unload_module("network").await.unwrap();
    assert!(journal.events("post_load").is_empty());
    assert!(journal.events("pre_unload").is_empty());
    assert_eq!(journal.events("unload"), vec!["network"]);
    assert!(broker.interfaces().is_empty());
    assert_eq!(loader.module_state("network").await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_same_module_operations_are_rejected_while_in_flight() {
    let started = Arc::new(Notify::new());
    let proceed = Arc::new(Notify::new());
    let unit = {
        let (started, proceed) = (Arc::clone(&started), Arc::clone(&proceed));
        StaticUnit::new("gated").with_factory(FnFactory::new("gate", move || {
            Box::new(Gate {
                started: Arc::clone(&started),
                proceed: Arc::clone(&proceed),
            }) as Box<dyn Module>
        }))
    };
    let (_broker, loader) = loader_for(unit);
    let loader = Arc::new(loader);

    let pending = {
        let loader = Arc::clone(&loader);
        tokio::spawn(async move { loader.add_module(None, "gate").await })
    };
    started.notified().await;

    assert!(matches!(
        loader.add_module(None, "gate").await,
        Err(LoaderError::ModuleInFlight(name)) if name == "gate"
    ));
    assert!(matches!(
        loader.unload_module("gate").await,
        Err(LoaderError::ModuleInFlight(_))
    ));

    proceed.notify_one();
    pending.await.unwrap().unwrap();
    assert_eq!(loader.module_state("gate").await, Some(ModuleState::Loaded));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_gets_and_releases_balance() {
    let journal = Journal::default();
    let (broker, loader) = loader_for(zone_unit(&journal));
    loader.add_module(None, "network").await.unwrap();
    let network_id = <dyn Network as Capability>::ID;

    let mut workers = Vec::new();
    for _ in 0..8 {
        let broker = Arc::clone(&broker);
        workers.push(tokio::spawn(async move {
            for _ in 0..500 {
                let network = broker.get_interface::<dyn Network>().unwrap();
                assert_eq!(network.port(), 5000);
                network.release().unwrap();
            }
        }));
    }

    let held: Vec<_> = (0..3)
        .map(|_| broker.get_interface::<dyn Network>().unwrap())
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }
    assert_eq!(broker.interfaces().outstanding_of(network_id), Some(3));

    drop(held);
    assert_eq!(broker.interfaces().outstanding_of(network_id), Some(0));
    assert_eq!(loader.unload_all().await.unwrap(), vec!["network"]);
}

#[tokio::test]
async fn test_config_file_and_config_errors() {
    let journal = Journal::default();
    let (_broker, loader) = loader_for(zone_unit(&journal));

    let mut cyclic = tempfile::NamedTempFile::new().unwrap();
    write!(
        cyclic,
        "[[modules]]\nname = \"network\"\ndepends_on = [\"relay\"]\n[[modules]]\nname = \"relay\"\ndepends_on = [\"network\"]\n"
    )
    .unwrap();
    let err = loader
        .load_from_config(&ConfigSource::file(cyclic.path()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LoaderError::Config(CatalogError::DependencyCycle(_))
    ));
    assert!(journal.events("create").is_empty());

    let mut valid = tempfile::NamedTempFile::new().unwrap();
    write!(valid, "{}", ZONE_CONFIG).unwrap();
    let loaded = loader
        .load_from_config(&ConfigSource::file(valid.path()))
        .await
        .unwrap();
    assert_eq!(loaded.len(), 3);

    // Loading the same modules again is a configuration error.
    assert!(matches!(
        loader
            .load_from_config(&ConfigSource::file(valid.path()))
            .await,
        Err(LoaderError::Config(CatalogError::AlreadyLoaded(_)))
    ));
}

#[tokio::test]
async fn test_module_info_lists_capabilities() {
    let journal = Journal::default();
    let (_broker, loader) = loader_for(zone_unit(&journal));
    loader.add_module(None, "network").await.unwrap();

    let info = loader.get_module_info("network").await.unwrap();
    assert_eq!(info.capabilities, vec![<dyn Network as Capability>::ID]);
    assert_eq!(info.state, ModuleState::Loaded);
    assert_eq!(info.unit, BUILTIN_UNIT);
}
