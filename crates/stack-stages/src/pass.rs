use stack_core::{Single, StageBuilder, StageHandle};
use stack_setup::SetupContext;

/// Stateless stage forwarding every call unchanged.
pub fn setup(ctx: &mut SetupContext<'_>) -> stack_setup::Result<Option<StageHandle>> {
    if !ctx.options().enabled("pass") {
        return Ok(None);
    }
    let base = ctx.setup_base()?;
    let stage = StageBuilder::<stack_core::PassThrough<Single>>::pass_through("pass").build(Some(base))?;
    Ok(Some(stage.into()))
}
