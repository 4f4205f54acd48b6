pub mod beacon;
pub mod tcp;

use std::collections::HashMap;

use crate::extender::ModuleFactory;

/// Statically linked module factories, keyed by the `extender_file` stem
/// named in plugin configs.
pub fn builtin_factories() -> HashMap<String, ModuleFactory> {
    let mut factories = HashMap::new();
    factories.insert(
        "agent_beacon".to_string(),
        ModuleFactory::Agent(beacon::init_plugin),
    );
    factories.insert(
        "listener_tcp".to_string(),
        ModuleFactory::Listener(tcp::init_plugin),
    );
    factories
}
