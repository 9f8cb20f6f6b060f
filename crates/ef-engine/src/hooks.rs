use ef_types::{Candidates, EfResult, Hook, HookContext, HookSet, Monitor, NodeContext, State, Tensor};
use tracing::debug;

/// A registered monitor and its resolved identity.
pub(crate) struct MonitorSlot {
    pub name: String,
    pub ctx: NodeContext,
    pub hooks: HookSet,
    pub monitor: Box<dyn Monitor>,
}

/// Stage-specific arguments passed to a hook.
#[derive(Clone, Copy)]
pub(crate) enum HookArgs<'a> {
    Empty,
    Candidates(&'a Candidates),
    Fitness(&'a Tensor),
    Evaluated(&'a Candidates, &'a Tensor),
}

/// Run `hook` on every subscribed monitor, in registration order, threading
/// each monitor's returned local state back into `state`.
pub(crate) fn dispatch(
    monitors: &[MonitorSlot],
    hook: Hook,
    mut state: State,
    generation: u64,
    lane: usize,
    args: HookArgs<'_>,
) -> EfResult<State> {
    for slot in monitors.iter().filter(|s| s.hooks.contains(hook)) {
        debug!(monitor = %slot.name, hook = hook.name(), generation, lane, "dispatching hook");
        let local = state.resolve(&slot.ctx.path)?;
        let ctx = HookContext {
            node: &slot.ctx,
            state: &state,
            generation,
            lane,
        };
        let m = &slot.monitor;
        let updated = match (hook, args) {
            (Hook::Setup, _) => m.setup(&ctx, local)?,
            (Hook::PreAsk, _) => m.pre_ask(&ctx, local)?,
            (Hook::PostAsk, HookArgs::Candidates(c)) => m.post_ask(&ctx, local, c)?,
            (Hook::PreEval, HookArgs::Candidates(c)) => m.pre_eval(&ctx, local, c)?,
            (Hook::PostEval, HookArgs::Evaluated(c, f)) => m.post_eval(&ctx, local, c, f)?,
            (Hook::PreTell, HookArgs::Fitness(f)) => m.pre_tell(&ctx, local, f)?,
            (Hook::PostTell, _) => m.post_tell(&ctx, local)?,
            (hook, _) => {
                return Err(ef_types::internal_error!(
                    "hook {} dispatched without its arguments",
                    hook.name()
                ))
            }
        };
        if let Some(new_local) = updated {
            state = state.update(&slot.ctx.path, new_local)?;
        }
    }
    Ok(state)
}
