//! Decide phase of a simulated day.
//!
//! Both functions only read infection states as they were at the end of the
//! previous day. They write staging flags of the targets and transmission
//! counters of the sources, which the commit phase consumes.

use crate::config::Config;
use crate::context::SimContext;
use crate::model::{Agent, InfectionState};
use crate::network::ContactGraph;
use anyhow::{Context, Result};

/// Probability that a source infects a contact during one day.
pub fn transmission_probability(
    source_risk: f64,
    base_modifier: f64,
    weight: f64,
    reception_risk: f64,
) -> f64 {
    source_risk * base_modifier * weight * reception_risk
}

/// Stage infections introduced from outside the community.
///
/// Returns the number of index cases.
pub fn introduce_index_cases(agents: &mut [Agent], ctx: &mut SimContext) -> Result<usize> {
    let mut n_index = 0;
    for agent in agents.iter_mut() {
        if !agent.state().is_susceptible() || agent.contact_to_infected() {
            continue;
        }
        if ctx.draw() <= agent.index_probability() {
            agent.stage_infection()?;
            log::debug!("{} {} is index case", agent.kind(), agent.id());
            n_index += 1;
        }
    }
    Ok(n_index)
}

/// Stage infections transmitted over the contact network.
///
/// Sources are visited in agent order and their contacts in adjacency order.
/// Returns the number of transmissions.
pub fn spread_infection(
    agents: &mut [Agent],
    graph: &ContactGraph,
    cfg: &Config,
    ctx: &mut SimContext,
) -> Result<usize> {
    let mut n_trans = 0;
    for i_src in 0..agents.len() {
        let src = &agents[i_src];
        if src.state() != InfectionState::Infectious || src.quarantined() {
            continue;
        }
        let src_cfg = cfg.type_config(src.kind())?;
        let source_risk = src.source_risk(cfg.disease.subclinical_modifier);

        for contact in graph.contacts(i_src) {
            let tgt = &agents[contact.agent];
            if !src_cfg.reaches(tgt.kind())
                || !tgt.state().is_susceptible()
                || tgt.contact_to_infected()
            {
                continue;
            }

            let base_modifier = cfg.contact_weight(&contact.contact_type)?;
            let prob = transmission_probability(
                source_risk,
                base_modifier,
                contact.weight,
                tgt.reception_risk(),
            );
            let prob_no_trans = 1.0 - prob;

            if ctx.draw() > prob_no_trans {
                let tgt = &mut agents[contact.agent];
                tgt.stage_infection()
                    .with_context(|| format!("failed to infect {}", contact.agent))?;
                let tgt_id = tgt.id().to_string();

                let src = &mut agents[i_src];
                log::trace!("transmission: {} {} -> {tgt_id}", src.kind(), src.id());
                src.record_transmission(tgt_id, ctx);
                n_trans += 1;
            }
        }
    }
    Ok(n_trans)
}
