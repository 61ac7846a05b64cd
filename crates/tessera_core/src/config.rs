use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use tessera_error::{EngineError, Result};

use crate::runtime::scheduler::Qos;
use crate::value::Value;

/// Number of rows a stream hands out per fetch by default.
pub const DEFAULT_BATCH_SIZE: usize = 256;

const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 65536;

/// Engine wide configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub parallel_chunk_size: usize,
    pub default_qos: Qos,
    /// Time limit for materializing a dataset, None for no limit.
    pub time_limit: Option<Duration>,
    pub enable_coalescing: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            parallel_chunk_size: DEFAULT_BATCH_SIZE / 8,
            default_qos: Qos::UserInitiated,
            time_limit: None,
            enable_coalescing: true,
        }
    }
}

impl EngineConfig {
    pub fn set(&mut self, name: &str, value: &Value) -> Result<()> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| EngineError::new(format!("Missing setting for '{name}'")))?;

        (func.set)(value, self)
    }

    pub fn get(&self, name: &str) -> Result<Value> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| EngineError::new(format!("Missing setting for '{name}'")))?;

        Ok((func.get)(self))
    }

    pub fn reset(&mut self, name: &str) -> Result<()> {
        let def = Self::default();
        let value = def.get(name)?;
        self.set(name, &value)
    }

    /// Names and descriptions of all settings, sorted by name.
    pub fn describe() -> Vec<(&'static str, &'static str)> {
        let mut out: Vec<_> = GET_SET_FUNCTIONS
            .iter()
            .map(|(name, funcs)| (*name, funcs.description))
            .collect();
        out.sort_unstable();
        out
    }
}

struct SettingFunctions {
    description: &'static str,
    set: fn(value: &Value, conf: &mut EngineConfig) -> Result<()>,
    get: fn(conf: &EngineConfig) -> Value,
}

impl SettingFunctions {
    const fn new<S: EngineSetting>() -> Self {
        SettingFunctions {
            description: S::DESCRIPTION,
            set: S::set_from_value as _,
            get: S::get_as_value as _,
        }
    }
}

fn insert_setting<S: EngineSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<BatchSize>(&mut map);
    insert_setting::<ParallelChunkSize>(&mut map);
    insert_setting::<DefaultQos>(&mut map);
    insert_setting::<TimeLimitMs>(&mut map);
    insert_setting::<EnableCoalescing>(&mut map);

    map
});

pub trait EngineSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_value(value: &Value, conf: &mut EngineConfig) -> Result<()>;
    fn get_as_value(conf: &EngineConfig) -> Value;
}

pub struct BatchSize;

impl BatchSize {
    pub fn validate_value(val: usize) -> Result<()> {
        if val < MIN_BATCH_SIZE {
            return Err(EngineError::new(format!(
                "Batch size cannot be less than {MIN_BATCH_SIZE}"
            )));
        }

        if val > MAX_BATCH_SIZE {
            return Err(EngineError::new(format!(
                "Batch size cannot be greater than {MAX_BATCH_SIZE}"
            )));
        }

        Ok(())
    }
}

impl EngineSetting for BatchSize {
    const NAME: &'static str = "batch_size";
    const DESCRIPTION: &'static str = "Desired number of rows in a batch";

    fn set_from_value(value: &Value, conf: &mut EngineConfig) -> Result<()> {
        let val = value.try_as_usize()?;
        Self::validate_value(val)?;
        conf.batch_size = val;
        Ok(())
    }

    fn get_as_value(conf: &EngineConfig) -> Value {
        conf.batch_size.into()
    }
}

pub struct ParallelChunkSize;

impl EngineSetting for ParallelChunkSize {
    const NAME: &'static str = "parallel_chunk_size";
    const DESCRIPTION: &'static str = "Number of items mapped per task in parallel map/reduce";

    fn set_from_value(value: &Value, conf: &mut EngineConfig) -> Result<()> {
        let val = value.try_as_usize()?;
        if val == 0 {
            return Err(EngineError::new("Parallel chunk size cannot be zero"));
        }
        conf.parallel_chunk_size = val;
        Ok(())
    }

    fn get_as_value(conf: &EngineConfig) -> Value {
        conf.parallel_chunk_size.into()
    }
}

pub struct DefaultQos;

impl EngineSetting for DefaultQos {
    const NAME: &'static str = "default_qos";
    const DESCRIPTION: &'static str = "Quality of service for root jobs ('user_initiated' or 'background')";

    fn set_from_value(value: &Value, conf: &mut EngineConfig) -> Result<()> {
        let name = value.try_as_string()?;
        conf.default_qos = Qos::from_name(&name)
            .ok_or_else(|| EngineError::new(format!("Unknown quality of service '{name}'")))?;
        Ok(())
    }

    fn get_as_value(conf: &EngineConfig) -> Value {
        conf.default_qos.name().into()
    }
}

pub struct TimeLimitMs;

impl EngineSetting for TimeLimitMs {
    const NAME: &'static str = "time_limit_ms";
    const DESCRIPTION: &'static str = "Milliseconds before a materialization expires, 0 disables";

    fn set_from_value(value: &Value, conf: &mut EngineConfig) -> Result<()> {
        let val = value.try_as_usize()?;
        conf.time_limit = match val {
            0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        };
        Ok(())
    }

    fn get_as_value(conf: &EngineConfig) -> Value {
        conf.time_limit
            .map(|d| d.as_millis() as usize)
            .unwrap_or(0)
            .into()
    }
}

pub struct EnableCoalescing;

impl EngineSetting for EnableCoalescing {
    const NAME: &'static str = "enable_coalescing";
    const DESCRIPTION: &'static str = "Merge adjacent dataset operations before executing";

    fn set_from_value(value: &Value, conf: &mut EngineConfig) -> Result<()> {
        conf.enable_coalescing = value.try_as_bool()?;
        Ok(())
    }

    fn get_as_value(conf: &EngineConfig) -> Value {
        conf.enable_coalescing.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_setting_exists() {
        let mut conf = EngineConfig::default();
        conf.set("batch_size", &Value::from(512)).unwrap();

        let val = conf.get("batch_size").unwrap();
        assert_eq!(Value::from(512), val);
    }

    #[test]
    fn set_setting_not_exists() {
        let mut conf = EngineConfig::default();
        conf.set("hell_world", &Value::from(58)).unwrap_err();
    }

    #[test]
    fn set_casts_value() {
        let mut conf = EngineConfig::default();
        conf.set("batch_size", &Value::from("13")).unwrap();
        assert_eq!(13, conf.batch_size);
    }

    #[test]
    fn batch_size_bounds() {
        let mut conf = EngineConfig::default();
        conf.set("batch_size", &Value::from(0)).unwrap_err();
        conf.set("batch_size", &Value::from(1_000_000)).unwrap_err();
        conf.set("batch_size", &Value::from(-4)).unwrap_err();
    }

    #[test]
    fn qos_and_time_limit() {
        let mut conf = EngineConfig::default();
        conf.set("default_qos", &Value::from("background")).unwrap();
        assert_eq!(Qos::Background, conf.default_qos);
        conf.set("default_qos", &Value::from("whenever")).unwrap_err();

        conf.set("time_limit_ms", &Value::from(250)).unwrap();
        assert_eq!(Some(Duration::from_millis(250)), conf.time_limit);
        conf.reset("time_limit_ms").unwrap();
        assert_eq!(None, conf.time_limit);
    }

    #[test]
    fn describe_lists_all() {
        let names: Vec<_> = EngineConfig::describe().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            vec![
                "batch_size",
                "default_qos",
                "enable_coalescing",
                "parallel_chunk_size",
                "time_limit_ms"
            ],
            names
        );
    }
}
