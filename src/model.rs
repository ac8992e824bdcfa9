use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "id", default)]
    pub sequence: Option<i64>,
    #[serde(rename = "client_id")]
    pub entity_id: EntityId,
    #[serde(rename = "cpu_usage")]
    pub cpu: f64,
    #[serde(rename = "ram_usage")]
    pub ram: f64,
    #[serde(rename = "disk_usage")]
    pub disk: f64,
    #[serde(rename = "inode_usage")]
    pub inode: f64,
    #[serde(rename = "docker_sz", default)]
    pub docker_size: Option<i64>,
    #[serde(rename = "gpu_usage", default)]
    pub gpu: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SampleError {
    #[error("field {field} is not a finite number")]
    NotFinite { field: &'static str },
    #[error("docker_sz must not be negative, got {0}")]
    NegativeDockerSize(i64),
}

impl Sample {
    pub fn validate(&self) -> Result<(), SampleError> {
        let fields = [
            ("cpu_usage", Some(self.cpu)),
            ("ram_usage", Some(self.ram)),
            ("disk_usage", Some(self.disk)),
            ("inode_usage", Some(self.inode)),
            ("gpu_usage", self.gpu),
        ];
        for (field, value) in fields {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(SampleError::NotFinite { field });
                }
            }
        }
        if let Some(size) = self.docker_size {
            if size < 0 {
                return Err(SampleError::NegativeDockerSize(size));
            }
        }
        Ok(())
    }

    pub fn cpu(&self) -> f64 {
        clamp_percent(self.cpu)
    }

    pub fn ram(&self) -> f64 {
        clamp_percent(self.ram)
    }

    pub fn disk(&self) -> f64 {
        clamp_percent(self.disk)
    }

    pub fn inode(&self) -> f64 {
        clamp_percent(self.inode)
    }

    pub fn gpu(&self) -> Option<f64> {
        self.gpu.map(clamp_percent)
    }

    pub fn value(&self, metric: MetricType) -> Option<f64> {
        match metric {
            MetricType::Cpu => Some(self.cpu()),
            MetricType::Ram => Some(self.ram()),
            MetricType::Disk => Some(self.disk()),
            MetricType::Inode => Some(self.inode()),
            MetricType::Gpu => self.gpu(),
        }
    }
}

pub fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Cpu,
    Ram,
    Disk,
    Inode,
    Gpu,
}

impl MetricType {
    pub const ALL: [MetricType; 5] = [
        MetricType::Cpu,
        MetricType::Ram,
        MetricType::Disk,
        MetricType::Inode,
        MetricType::Gpu,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::Cpu => "cpu",
            MetricType::Ram => "ram",
            MetricType::Disk => "disk",
            MetricType::Inode => "inode",
            MetricType::Gpu => "gpu",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown metric type '{0}', expected one of cpu, ram, disk, inode, gpu")]
pub struct UnknownMetricType(String);

impl FromStr for MetricType {
    type Err = UnknownMetricType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownMetricType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: EntityId,
    pub hostname: String,
    pub last_seen: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub client_id: EntityId,
    pub metric_type: String,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p95: f64,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    #[serde(default)]
    pub client_id: Option<EntityId>,
    pub metric_type: String,
    pub threshold: f64,
    pub duration_sec: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRuleInput {
    pub client_id: Option<EntityId>,
    pub metric_type: MetricType,
    pub threshold: f64,
    pub duration_sec: Option<i64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum AlertRuleError {
    #[error("threshold must be within 0..100, got {0}")]
    Threshold(f64),
    #[error("duration_sec must not be negative, got {0}")]
    Duration(i64),
}

impl AlertRuleInput {
    pub fn validate(&self) -> Result<(), AlertRuleError> {
        if !(0.0..=100.0).contains(&self.threshold) {
            return Err(AlertRuleError::Threshold(self.threshold));
        }
        if let Some(d) = self.duration_sec {
            if d < 0 {
                return Err(AlertRuleError::Duration(d));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn sample_at(entity: &str, secs: i64) -> Sample {
        Sample {
            sequence: None,
            entity_id: EntityId::from(entity),
            cpu: 10.0,
            ram: 20.0,
            disk: 30.0,
            inode: 5.0,
            docker_size: None,
            gpu: None,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn decodes_backend_metric_row() {
        let json = r#"{
            "id": 42,
            "client_id": "c-1",
            "cpu_usage": 12.5,
            "ram_usage": 40.0,
            "disk_usage": 71.2,
            "inode_usage": 3.0,
            "docker_sz": 1048576,
            "gpu_usage": null,
            "timestamp": "2025-03-01T10:00:05.250+00:00"
        }"#;
        let sample: Sample = serde_json::from_str(json).unwrap();
        assert_eq!(sample.sequence, Some(42));
        assert_eq!(sample.entity_id.as_str(), "c-1");
        assert_eq!(sample.docker_size, Some(1_048_576));
        assert_eq!(sample.gpu, None);
        assert_eq!(sample.timestamp.timestamp_millis(), 1_740_823_205_250);
    }

    #[test]
    fn accessors_clamp_out_of_range_values() {
        let mut sample = sample_at("c-1", 0);
        sample.cpu = 130.0;
        sample.ram = -4.0;
        sample.gpu = Some(101.0);
        assert_eq!(sample.cpu(), 100.0);
        assert_eq!(sample.ram(), 0.0);
        assert_eq!(sample.gpu(), Some(100.0));
        assert_eq!(sample.value(MetricType::Disk), Some(30.0));
    }

    #[test]
    fn validate_rejects_non_finite_fields() {
        let mut sample = sample_at("c-1", 0);
        sample.inode = f64::NAN;
        assert_eq!(
            sample.validate(),
            Err(SampleError::NotFinite {
                field: "inode_usage"
            })
        );
    }

    #[test]
    fn metric_type_parses_case_insensitively() {
        assert_eq!("CPU".parse::<MetricType>().unwrap(), MetricType::Cpu);
        assert!("swap".parse::<MetricType>().is_err());
    }

    #[test]
    fn alert_rule_threshold_is_bounded() {
        let rule = AlertRuleInput {
            client_id: None,
            metric_type: MetricType::Ram,
            threshold: 120.0,
            duration_sec: Some(60),
        };
        assert_eq!(rule.validate(), Err(AlertRuleError::Threshold(120.0)));
    }
}
