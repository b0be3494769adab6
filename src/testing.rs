//! Testing, contact tracing and quarantine.

use crate::config::{Config, TestingConfig};
use crate::context::{ScreenKind, SimContext};
use crate::model::Agent;
use crate::network::ContactGraph;
use anyhow::{Context, Result};

/// Perform the testing phase of the current day.
///
/// Runs after all agents advanced. Tests are issued first, then due results
/// are collected, so that tests with a turnover of zero days return on the day
/// they are taken. Positive results trigger contact tracing and reactive
/// screens, whose results return on later days.
pub fn perform_testing(
    agents: &mut [Agent],
    graph: &ContactGraph,
    cfg: &Config,
    ctx: &mut SimContext,
) -> Result<()> {
    let testing = &cfg.testing;
    if !testing.enabled {
        return Ok(());
    }

    ctx.screened.reset();

    test_symptomatic_agents(agents, testing, ctx).context("failed to test symptomatic agents")?;

    for (kind, params) in &cfg.types {
        let Some(interval) = params.screening_interval else {
            continue;
        };
        if ctx.day % interval == 0 {
            let n_tests = screen_agents(
                agents,
                kind,
                &testing.preventive_test_type,
                ScreenKind::Preventive,
                testing,
                ctx,
            )
            .context("failed to perform preventive screen")?;
            ctx.counters.preventive_tests += n_tests;
        }
    }

    if let Some(interval) = testing.follow_up_interval
        && let Some(last_day) = ctx.last_positive_day
        && ctx.day == last_day + interval
    {
        for kind in cfg.types.keys() {
            let n_tests = screen_agents(
                agents,
                kind,
                &testing.diagnostic_test_type,
                ScreenKind::FollowUp,
                testing,
                ctx,
            )
            .context("failed to perform follow-up screen")?;
            ctx.counters.diagnostic_tests += n_tests;
        }
    }

    collect_test_results(agents, testing, ctx).context("failed to collect test results")?;

    if ctx.newly_positive.is_empty() {
        return Ok(());
    }

    trace_contacts(agents, graph, testing, ctx);

    for (kind, params) in &cfg.types {
        if params.reactive_screening {
            let n_tests = screen_agents(
                agents,
                kind,
                &testing.diagnostic_test_type,
                ScreenKind::Reactive,
                testing,
                ctx,
            )
            .context("failed to perform reactive screen")?;
            ctx.counters.diagnostic_tests += n_tests;
        }
    }

    ctx.newly_positive.clear();
    ctx.last_positive_day = Some(ctx.day);

    Ok(())
}

/// Whether an agent can be included in a screen.
fn is_eligible(agent: &Agent) -> bool {
    !agent.state().is_recovered()
        && !agent.known_positive()
        && agent.pending_test().is_none()
        && !agent.tested()
}

fn test_symptomatic_agents(
    agents: &mut [Agent],
    testing: &TestingConfig,
    ctx: &mut SimContext,
) -> Result<()> {
    let test = testing.test(&testing.diagnostic_test_type)?;
    for agent in agents.iter_mut() {
        if agent.symptoms() && is_eligible(agent) {
            agent.receive_test(&testing.diagnostic_test_type, test)?;
            ctx.counters.diagnostic_tests += 1;
            log::debug!("{} {} sent to diagnostic testing", agent.kind(), agent.id());
        }
    }
    Ok(())
}

/// Test every eligible agent of a type. Returns the number of tests issued.
fn screen_agents(
    agents: &mut [Agent],
    kind: &str,
    test_type: &str,
    screen: ScreenKind,
    testing: &TestingConfig,
    ctx: &mut SimContext,
) -> Result<u64> {
    let test = testing.test(test_type)?;
    let mut n_tests = 0;
    for agent in agents.iter_mut().filter(|agent| agent.kind() == kind) {
        if is_eligible(agent) {
            agent.receive_test(test_type, test)?;
            n_tests += 1;
        }
    }
    ctx.screened.mark(screen, kind);
    log::debug!("{screen:?} screen of {kind} agents with {n_tests} {test_type} tests");
    Ok(n_tests)
}

fn collect_test_results(
    agents: &mut [Agent],
    testing: &TestingConfig,
    ctx: &mut SimContext,
) -> Result<()> {
    for (i_agt, agent) in agents.iter_mut().enumerate() {
        let Some(pending) = agent.pending_test() else {
            continue;
        };
        let test = testing.test(&pending.test_type)?;
        if agent.days_since_tested() >= test.turnover {
            agent.act_on_test_result(i_agt, testing, ctx)?;
        }
    }
    Ok(())
}

/// Quarantine the K1 contacts of all agents with new positive results.
fn trace_contacts(
    agents: &mut [Agent],
    graph: &ContactGraph,
    testing: &TestingConfig,
    ctx: &SimContext,
) {
    for &i_pos in &ctx.newly_positive {
        for contact in graph.contacts(i_pos) {
            if !testing.is_k1(&contact.contact_type) {
                continue;
            }
            let k1 = &mut agents[contact.agent];
            if !k1.state().is_recovered() && k1.quarantine() {
                log::debug!("K1 contact {} {} traced", k1.kind(), k1.id());
            }
        }
    }
}
