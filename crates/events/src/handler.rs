/// Execute an aggregate command deterministically (no IO, no async).
///
/// 1. **Decide**: calls `aggregate.handle(command)` (pure, no mutation)
/// 2. **Evolve**: applies each returned event via `aggregate.apply(event)`
///
/// The aggregate is mutated in place; persisting it is the caller's job. An empty
/// result means the command was a no-op and nothing needs to be written.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: pledgebank_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
