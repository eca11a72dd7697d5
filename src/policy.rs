//! The request/response vocabulary spoken with the external decision service.

use std::str::FromStr;

use serde::Serialize;

use crate::config::{GatewayConfig, SimConfig};
use crate::nodes::{NodeKind, Topology};
use crate::types::Duration;
use crate::utils::prelude::*;

pub mod client;

pub use client::DecisionClient;

/// Something that answers requests, the TCP client in production
pub trait DecisionPolicy {
    fn request(&mut self, req: &Request) -> Result<String>;
}

impl<P: DecisionPolicy + ?Sized> DecisionPolicy for Box<P> {
    #[inline]
    fn request(&mut self, req: &Request) -> Result<String> {
        (**self).request(req)
    }
}

/// One line of the wire protocol
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Setup { data: SetupPayload },
    AskDecision { data: StatePayload },
    SaveReward { data: RewardPayload },
    Retrain { data: StatePayload },
    SaveModel { episode_number: usize },
    NextEpisode,
}

impl Request {
    pub fn ask_decision(action_id: u64, state: Vec<f64>) -> Self {
        Self::AskDecision {
            data: StatePayload { action_id, state },
        }
    }

    pub fn save_reward(action_id: u64, reward: f64) -> Self {
        Self::SaveReward {
            data: RewardPayload { action_id, reward },
        }
    }

    pub fn retrain(action_id: u64, state: Vec<f64>) -> Self {
        Self::Retrain {
            data: StatePayload { action_id, state },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Setup { .. } => "setup",
            Request::AskDecision { .. } => "ask_decision",
            Request::SaveReward { .. } => "save_reward",
            Request::Retrain { .. } => "retrain",
            Request::SaveModel { .. } => "save_model",
            Request::NextEpisode => "next_episode",
        }
    }

    /// The JSON line sent on the wire, newline included
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatePayload {
    pub action_id: u64,
    pub state: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardPayload {
    pub action_id: u64,
    pub reward: f64,
}

/// Describes the environment once, before the first episode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupPayload {
    pub setup_name: String,
    pub strategy: String,
    pub random_seed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<[f64; 5]>,
    pub fog: Vec<[f64; 5]>,
    pub cloud_nodes_upload_bandwidth: f64,
    pub cloud_nodes_download_bandwidth: f64,
    pub fog_nodes_upload_bandwidth: f64,
    pub fog_nodes_download_bandwidth: f64,
    pub latency_gateway_fog_node: f64,
    pub latency_gateway_cloud_node: f64,
    pub priorities_quantity: u8,
    #[serde(rename = "load_pretrained_model_on", skip_serializing_if = "Option::is_none")]
    pub load_pretrained_model: Option<bool>,
    #[serde(rename = "training_on", skip_serializing_if = "Option::is_none")]
    pub training: Option<bool>,
    #[serde(rename = "save_final_model_on", skip_serializing_if = "Option::is_none")]
    pub save_final_model: Option<bool>,
}

impl SetupPayload {
    pub fn new(cfg: &SimConfig, dataset: &str, topology: &Topology, random_seed: u64) -> Self {
        let policy = &cfg.policy;
        // learning flags only mean something to learning strategies
        let drl = policy.strategy.contains("DRL");
        let flag = |f: Option<bool>| if drl { f } else { None };

        Self {
            setup_name: format!(
                "{}-{}-{}-{}-{}-{}",
                cfg.experiment.name,
                dataset,
                cfg.experiment.strategy,
                policy.strategy,
                topology.features_of(NodeKind::Fog).len(),
                random_seed
            ),
            strategy: policy.strategy.clone(),
            random_seed,
            cloud: topology.features_of(NodeKind::Cloud).first().copied(),
            fog: topology.features_of(NodeKind::Fog),
            cloud_nodes_upload_bandwidth: cfg.network.cloud_upload_bandwidth,
            cloud_nodes_download_bandwidth: cfg.network.cloud_download_bandwidth,
            fog_nodes_upload_bandwidth: cfg.network.fog_upload_bandwidth,
            fog_nodes_download_bandwidth: cfg.network.fog_download_bandwidth,
            latency_gateway_fog_node: cfg.network.fog_latency,
            latency_gateway_cloud_node: cfg.network.cloud_latency,
            priorities_quantity: policy.priorities_quantity,
            load_pretrained_model: flag(policy.drl.load_pretrained_model),
            training: flag(policy.drl.training),
            save_final_model: flag(policy.drl.save_final_model),
        }
    }
}

/// Converts compute time measured on the service host into simulated gateway time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionCostModel {
    pub real_mips: f64,
    pub simulated_mips: f64,
    pub charge_compute_time: bool,
}

impl DecisionCostModel {
    pub fn new(cfg: &GatewayConfig, simulated_mips: f64) -> Self {
        Self {
            real_mips: cfg.real_mips,
            simulated_mips,
            charge_compute_time: cfg.charge_compute_time,
        }
    }

    pub fn simulated(&self, measured: f64) -> Duration {
        if !self.charge_compute_time {
            return Duration::ZERO;
        }
        Duration(measured * self.real_mips / self.simulated_mips)
    }
}

/// A parsed `"<time>,<cpu%>d<a0>,<a1>,..."` decision response
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionResult {
    /// simulated gateway time spent on the decision
    pub cost: Duration,
    /// cpu load observed on the service host while deciding
    pub cpu_percent: f64,
    pub action: Vec<i64>,
}

impl DecisionResult {
    pub fn parse(raw: &str, model: &DecisionCostModel) -> Result<Self> {
        let (cost, action) = raw
            .trim()
            .split_once('d')
            .ok_or_else(|| Error::malformed_response(raw, "missing `d` separator"))?;

        let (time, cpu) = cost
            .split_once(',')
            .ok_or_else(|| Error::malformed_response(raw, "expected `<time>,<cpu>`"))?;
        let time: f64 = parse_field(raw, time)?;
        let cpu_percent: f64 = parse_field(raw, cpu)?;

        let action = action
            .split(',')
            .map(|a| parse_field(raw, a))
            .collect::<Result<Vec<i64>>>()?;

        Ok(Self {
            cost: model.simulated(time),
            cpu_percent,
            action,
        })
    }

    /// The service found no node able to take any task
    pub fn no_capacity(&self) -> bool {
        self.action.first() == Some(&-1)
    }
}

fn parse_field<T>(raw: &str, field: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    field
        .trim()
        .parse()
        .map_err(|e: T::Err| Error::malformed_response(raw, format!("`{}`: {}", field.trim(), e)))
}
