//! Kill scoring modules, built as a loadable unit.
//!
//! ```toml
//! [[modules]]
//! name = "prng"
//!
//! [[modules]]
//! name = "kill-prizes"
//! unit = "unit_scoring"
//! ```

use module_system::contracts::{KillContext, KillPoints, KillReward, Prng};
use module_system::{
    async_trait, declare_module_unit, Broker, FnFactory, Module, ModuleContext, ModuleError,
    ModuleFactory,
};
use std::sync::Arc;
use tracing::debug;

/// Name the unit reports for itself.
pub const UNIT_NAME: &str = "scoring";

/// Awards the killed player's bounty.
pub struct BountyPoints;

impl KillPoints for BountyPoints {
    fn kill_points(&self, kill: &KillContext) -> KillReward {
        KillReward {
            points: kill.bounty,
            prize: None,
        }
    }
}

/// Awards a fixed amount per flag the killed player carried.
pub struct FlagPoints {
    pub per_flag: i32,
}

impl KillPoints for FlagPoints {
    fn kill_points(&self, kill: &KillContext) -> KillReward {
        KillReward {
            points: self.per_flag.saturating_mul(kill.flags.count_ones() as i32),
            prize: None,
        }
    }
}

/// Occasionally hands out a random prize. The generator is looked up per
/// kill and released straight away, so this never pins the `prng` module.
pub struct KillPrizes {
    broker: Arc<Broker>,
    /// One kill in `chance` earns a prize
    chance: u32,
    prize_count: u16,
}

impl KillPoints for KillPrizes {
    fn kill_points(&self, _kill: &KillContext) -> KillReward {
        let Ok(prng) = self.broker.get_interface::<dyn Prng>() else {
            return KillReward::default();
        };
        let prize = (prng.below(self.chance) == 0)
            .then(|| prng.below(u32::from(self.prize_count)) as i16 + 1);
        KillReward { points: 0, prize }
    }
}

/// Registers one advisor at load and nothing else.
struct AdvisorModule<F> {
    name: &'static str,
    priority: i32,
    build: F,
}

#[async_trait]
impl<F, A> Module for AdvisorModule<F>
where
    F: Fn(&ModuleContext) -> A + Send + Sync,
    A: KillPoints + 'static,
{
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn load(&mut self, ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
        let advisor = (self.build)(ctx.as_ref());
        ctx.register_advisor::<dyn KillPoints>(Arc::new(advisor), self.priority);
        debug!("{} advising kill points at priority {}", self.name, self.priority);
        Ok(())
    }
}

pub fn bounty_points() -> impl ModuleFactory {
    FnFactory::new("bounty-points", || {
        Box::new(AdvisorModule {
            name: "bounty-points",
            priority: 0,
            build: |_: &ModuleContext| BountyPoints,
        }) as Box<dyn Module>
    })
}

pub fn flag_points() -> impl ModuleFactory {
    FnFactory::new("flag-points", || {
        Box::new(AdvisorModule {
            name: "flag-points",
            priority: 10,
            build: |_: &ModuleContext| FlagPoints { per_flag: 5 },
        }) as Box<dyn Module>
    })
}

pub fn kill_prizes() -> impl ModuleFactory {
    FnFactory::new("kill-prizes", || {
        Box::new(AdvisorModule {
            name: "kill-prizes",
            priority: 20,
            build: |ctx: &ModuleContext| KillPrizes {
                broker: Arc::clone(ctx.broker()),
                chance: 4,
                prize_count: 28,
            },
        }) as Box<dyn Module>
    })
    .depends_on(["prng"])
}

declare_module_unit!(UNIT_NAME, [bounty_points(), flag_points(), kill_prizes()]);

#[cfg(test)]
mod tests {
    use super::*;
    use module_system::contracts::{award_kill, ArenaId, PlayerId};
    use module_system::{ConfigSource, ModuleLoader, ModuleUnit, StaticUnit, UnitResolver, BUILTIN_UNIT};

    struct ZeroPrng;

    impl Prng for ZeroPrng {
        fn fill_secure(&self, _buf: &mut [u8]) -> bool {
            false
        }
        fn fill_fast(&self, buf: &mut [u8]) {
            buf.fill(0);
        }
        fn below(&self, _bound: u32) -> u32 {
            0
        }
        fn next_u32(&self) -> u32 {
            0
        }
        fn uniform(&self) -> f64 {
            0.0
        }
    }

    struct ZeroPrngModule;

    #[async_trait]
    impl Module for ZeroPrngModule {
        fn name(&self) -> &str {
            "prng"
        }

        async fn load(&mut self, ctx: Arc<ModuleContext>) -> Result<(), ModuleError> {
            ctx.register_interface::<dyn Prng>(Arc::new(ZeroPrng))?;
            Ok(())
        }
    }

    fn kill(bounty: i32, flags: u32) -> KillContext {
        KillContext {
            arena: ArenaId::new(),
            killer: PlayerId::new(),
            killed: PlayerId::new(),
            bounty,
            flags,
        }
    }

    #[test]
    fn test_exported_entry_point() {
        let raw = create_module_unit();
        assert!(!raw.is_null());
        // SAFETY: the pointer comes from Box::into_raw in the same binary.
        let unit = unsafe { Box::from_raw(raw) };

        assert_eq!(unit.name(), UNIT_NAME);
        let mut names = unit.module_names();
        names.sort();
        assert_eq!(names, vec!["bounty-points", "flag-points", "kill-prizes"]);
        assert_eq!(
            unit.factory("kill-prizes").map(|factory| factory.dependencies()),
            Some(vec!["prng".to_string()])
        );
    }

    #[test]
    fn test_flag_points_count_flags() {
        let advisor = FlagPoints { per_flag: 5 };
        assert_eq!(advisor.kill_points(&kill(0, 0b1011)).points, 15);
    }

    #[tokio::test]
    async fn test_scoring_through_loader() {
        let unit = StaticUnit::new(BUILTIN_UNIT)
            .with_factory(FnFactory::new("prng", || Box::new(ZeroPrngModule) as Box<dyn Module>))
            .with_factory(bounty_points())
            .with_factory(flag_points())
            .with_factory(kill_prizes());
        let broker = Arc::new(Broker::new());
        let loader = ModuleLoader::new(broker.clone(), Arc::new(UnitResolver::new(unit)));

        let loaded = loader
            .load_from_config(&ConfigSource::inline(
                "[[modules]]\nname = \"kill-prizes\"\n\n\
                 [[modules]]\nname = \"bounty-points\"\n\n\
                 [[modules]]\nname = \"flag-points\"\n\n\
                 [[modules]]\nname = \"prng\"\n",
            ))
            .await
            .unwrap();
        assert_eq!(loaded, vec!["bounty-points", "flag-points", "prng", "kill-prizes"]);

        // ZeroPrng always wins the draw and picks the first prize.
        let reward = award_kill(&broker, &kill(30, 0b11)).unwrap();
        assert_eq!(reward, KillReward { points: 40, prize: Some(1) });

        assert_eq!(broker.interfaces().outstanding_of(<dyn Prng as module_system::Capability>::ID), Some(0));
        loader.unload_all().await.unwrap();
        assert!(broker.advisors().is_empty());
    }
}
