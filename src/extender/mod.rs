pub mod agent_api;
pub mod capability;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

pub use capability::{
    AgentModule, CommandArgs, FeatureSet, ListenerModule, ModuleFactory, SupportMatrix,
};

/// Registered listener module description, surfaced to operator tooling.
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    pub name: String,
    pub listener_type: String,
    pub protocol: String,
    pub ax: String,
}

impl ListenerInfo {
    pub fn registry_key(&self) -> String {
        format!("{}/{}/{}", self.listener_type, self.protocol, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub name: String,
    pub watermark: String,
    pub ax: String,
    pub listeners: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigListener {
    extender_file: String,
    ax_file: String,
    listener_name: String,
    listener_type: String,
    protocol: String,
}

#[derive(Debug, Deserialize)]
struct ConfigAgent {
    extender_file: String,
    ax_file: String,
    agent_name: String,
    agent_watermark: String,
    #[serde(default)]
    listeners: Vec<String>,
}

/// Module registry. Populated once at startup from plugin config files and
/// read-only afterwards. A bad plugin is logged and skipped; loading never
/// aborts the server.
pub struct Extender {
    listener_modules: HashMap<String, Arc<dyn ListenerModule>>,
    agent_modules: HashMap<String, Arc<dyn AgentModule>>,
    listener_types: HashMap<String, ListenerInfo>,
    agent_types: HashMap<String, AgentInfo>,
}

impl Extender {
    pub fn load(
        config_paths: &[PathBuf],
        factories: &HashMap<String, ModuleFactory>,
        listener_state_dir: &Path,
    ) -> Self {
        let mut extender = Self {
            listener_modules: HashMap::new(),
            agent_modules: HashMap::new(),
            listener_types: HashMap::new(),
            agent_types: HashMap::new(),
        };

        for path in config_paths {
            if let Err(e) = std::fs::metadata(path) {
                tracing::error!(path = %path.display(), "config not found: {}", e);
                continue;
            }
            let config_data = match std::fs::read(path) {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!(path = %path.display(), "config read error: {}", e);
                    continue;
                }
            };
            let config_map: serde_json::Value = match serde_json::from_slice(&config_data) {
                Ok(value) => value,
                Err(e) => {
                    tracing::error!(path = %path.display(), "config parse error: {}", e);
                    continue;
                }
            };

            match config_map.get("extender_type").and_then(|v| v.as_str()) {
                Some("listener") => {
                    extender.load_listener(path, &config_data, factories, listener_state_dir)
                }
                Some("agent") => extender.load_agent(path, &config_data, factories),
                Some(other) => {
                    tracing::error!(path = %path.display(), "unknown extender_type {:?}", other);
                }
                None => {
                    tracing::error!(path = %path.display(), "extender_type not found");
                }
            }
        }

        extender
    }

    fn load_listener(
        &mut self,
        config_path: &Path,
        config_data: &[u8],
        factories: &HashMap<String, ModuleFactory>,
        listener_state_dir: &Path,
    ) {
        let config: ConfigListener = match serde_json::from_slice(config_data) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %config_path.display(), "listener config parse error: {}", e);
                return;
            }
        };

        let module_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        let factory = match factories.get(module_stem(&config.extender_file)) {
            Some(ModuleFactory::Listener(factory)) => factory,
            Some(ModuleFactory::Agent(_)) => {
                tracing::error!(
                    module = %config.extender_file,
                    "unexpected factory signature: agent factory for listener config"
                );
                return;
            }
            None => {
                tracing::error!(module = %config.extender_file, "no factory registered");
                return;
            }
        };

        let ax = match std::fs::read_to_string(module_dir.join(&config.ax_file)) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(ax = %config.ax_file, "failed to read ax file: {}", e);
                return;
            }
        };

        let info = ListenerInfo {
            name: config.listener_name,
            listener_type: config.listener_type,
            protocol: config.protocol,
            ax,
        };
        let key = info.registry_key();
        if self.listener_types.contains_key(&key) {
            tracing::error!(key = %key, "listener module already registered");
            return;
        }

        let module = factory(module_dir, listener_state_dir);
        self.listener_modules.insert(key.clone(), module);
        self.listener_types.insert(key.clone(), info);
        tracing::info!(key = %key, "listener module loaded");
    }

    fn load_agent(
        &mut self,
        config_path: &Path,
        config_data: &[u8],
        factories: &HashMap<String, ModuleFactory>,
    ) {
        let config: ConfigAgent = match serde_json::from_slice(config_data) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %config_path.display(), "agent config parse error: {}", e);
                return;
            }
        };

        let module_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        let factory = match factories.get(module_stem(&config.extender_file)) {
            Some(ModuleFactory::Agent(factory)) => factory,
            Some(ModuleFactory::Listener(_)) => {
                tracing::error!(
                    module = %config.extender_file,
                    "unexpected factory signature: listener factory for agent config"
                );
                return;
            }
            None => {
                tracing::error!(module = %config.extender_file, "no factory registered");
                return;
            }
        };

        let ax = match std::fs::read_to_string(module_dir.join(&config.ax_file)) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(ax = %config.ax_file, "failed to read ax file: {}", e);
                return;
            }
        };

        let info = AgentInfo {
            name: config.agent_name,
            watermark: config.agent_watermark,
            ax,
            listeners: config.listeners,
        };
        if self.agent_types.contains_key(&info.name) {
            tracing::error!(name = %info.name, "agent module already registered");
            return;
        }

        let module = factory(module_dir, &info.watermark);
        self.agent_modules.insert(info.name.clone(), module);
        self.agent_types.insert(info.name.clone(), info);
    }

    /// Register a module directly, bypassing config files. Used by built-in
    /// deployments and tests.
    pub fn register_listener(&mut self, info: ListenerInfo, module: Arc<dyn ListenerModule>) {
        let key = info.registry_key();
        self.listener_modules.insert(key.clone(), module);
        self.listener_types.insert(key, info);
    }

    pub fn register_agent(&mut self, info: AgentInfo, module: Arc<dyn AgentModule>) {
        self.agent_modules.insert(info.name.clone(), module);
        self.agent_types.insert(info.name.clone(), info);
    }

    pub fn listener_module(&self, key: &str) -> crate::Result<Arc<dyn ListenerModule>> {
        self.listener_modules
            .get(key)
            .cloned()
            .ok_or_else(|| crate::UmbraError::ModuleNotFound(key.to_string()))
    }

    pub fn agent_module(&self, name: &str) -> crate::Result<Arc<dyn AgentModule>> {
        self.agent_modules
            .get(name)
            .cloned()
            .ok_or_else(|| crate::UmbraError::ModuleNotFound(name.to_string()))
    }

    pub fn listener_info(&self, key: &str) -> Option<&ListenerInfo> {
        self.listener_types.get(key)
    }

    pub fn agent_info(&self, name: &str) -> Option<&AgentInfo> {
        self.agent_types.get(name)
    }

    pub fn agent_name_by_watermark(&self, watermark: &str) -> Option<String> {
        self.agent_types
            .values()
            .find(|info| info.watermark == watermark)
            .map(|info| info.name.clone())
    }
}

fn module_stem(extender_file: &str) -> &str {
    let name = extender_file
        .rsplit('/')
        .next()
        .unwrap_or(extender_file);
    name.split('.').next().unwrap_or(name)
}
