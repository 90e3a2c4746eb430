/// Axiom VM Configuration
///
/// All configuration is persisted to ~/.axiom/conf.txt
/// Format: property=value (one per line, comments with #)
///
/// CLI:
///   axiom conf set property=value
///   axiom conf get property
///   axiom conf list
///   axiom conf reset
///   axiom conf describe property

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct PropDef {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
    pub category: Category,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Category {
    Debug,
    Gc,
    Scheduler,
    Limits,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// All known configuration properties. Only things that affect this VM
/// core are listed here — no inline-cache/quickening/NaN-boxing/JIT
/// properties, since this crate implements none of those.
pub static ALL_PROPS: &[PropDef] = &[
    PropDef {
        name: "debug",
        default: "off",
        description: "Master debug switch. Enables opcode tracing and extra runtime assertions.",
        category: Category::Debug,
    },
    PropDef {
        name: "gc_verbose",
        default: "off",
        description: "Print a line to stderr for every GC collection: objects freed, objects live, next threshold.",
        category: Category::Debug,
    },
    PropDef {
        name: "bounds_check",
        default: "on",
        description: "Enable array/buffer bounds checking on index operations.",
        category: Category::Debug,
    },
    PropDef {
        name: "gc_growth_factor",
        default: "2.0",
        description: "Multiplier applied to live bytes after a collection to compute the next GC threshold.",
        category: Category::Gc,
    },
    PropDef {
        name: "gc_min_threshold",
        default: "524288",
        description: "Lower clamp (bytes) for the computed GC threshold.",
        category: Category::Gc,
    },
    PropDef {
        name: "gc_max_threshold",
        default: "536870912",
        description: "Upper clamp (bytes) for the computed GC threshold.",
        category: Category::Gc,
    },
    PropDef {
        name: "pool_min_size",
        default: "16",
        description: "Floor size of the recycled process pool; the pool never shrinks below this.",
        category: Category::Scheduler,
    },
    PropDef {
        name: "stack_max",
        default: "256",
        description: "Per-process operand stack capacity, in slots.",
        category: Category::Limits,
    },
    PropDef {
        name: "frames_max",
        default: "64",
        description: "Per-process call-frame capacity.",
        category: Category::Limits,
    },
    PropDef {
        name: "gosub_max",
        default: "16",
        description: "Per-process gosub-stack capacity.",
        category: Category::Limits,
    },
    PropDef {
        name: "try_max",
        default: "16",
        description: "Per-process try-handler stack capacity.",
        category: Category::Limits,
    },
    PropDef {
        name: "max_call_depth",
        default: "500",
        description: "Native-call recursion guard independent of the bytecode frame limit.",
        category: Category::Limits,
    },
];

pub struct AxConf {
    values: HashMap<String, String>,
}

impl AxConf {
    /// Load configuration from the default config file path, falling back
    /// to defaults for anything the file doesn't override.
    pub fn load() -> Self {
        let mut conf = AxConf { values: HashMap::new() };
        for prop in ALL_PROPS {
            conf.values.insert(prop.name.to_string(), prop.default.to_string());
        }
        if let Some(path) = Self::config_path() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.starts_with('#') || line.is_empty() {
                        continue;
                    }
                    if let Some((k, v)) = line.split_once('=') {
                        conf.values.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            }
        }
        conf
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".axiom").join("conf.txt"))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some("on") | Some("true") | Some("yes") | Some("1"))
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        if !ALL_PROPS.iter().any(|p| p.name == key) {
            return Err(format!(
                "Unknown configuration property: '{}'\nRun `axiom conf list` to see all properties.",
                key
            ));
        }
        self.values.insert(key.to_string(), value.to_string());
        self.save()
    }

    pub fn save(&self) -> Result<(), String> {
        let path = Self::config_path().ok_or("Cannot determine config path")?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| format!("Cannot create config dir: {}", e))?;
        }

        let mut out = String::new();
        out.push_str("# Axiom VM Configuration — ~/.axiom/conf.txt\n");
        out.push_str("# Edit manually or use: axiom conf set property=value\n");
        out.push_str("# Reset to defaults:     axiom conf reset\n\n");

        let mut by_category: Vec<(&PropDef, &str)> = ALL_PROPS
            .iter()
            .map(|p| (p, self.values.get(p.name).map(|s| s.as_str()).unwrap_or(p.default)))
            .collect();
        by_category.sort_by_key(|(p, _)| format!("{:?}", p.category));

        let mut current_cat: Option<String> = None;
        for (prop, value) in &by_category {
            let cat = format!("{:?}", prop.category);
            if current_cat.as_deref() != Some(cat.as_str()) {
                out.push_str(&format!("\n# ── {} ─────────────────────────\n", cat));
                current_cat = Some(cat);
            }
            out.push_str(&format!("{}={}\n", prop.name, value));
        }

        std::fs::write(&path, &out).map_err(|e| format!("Cannot write config: {}", e))?;
        Ok(())
    }

    pub fn reset() -> Result<(), String> {
        let path = Self::config_path().ok_or("Cannot determine config path")?;
        let mut out = String::new();
        out.push_str("# Axiom VM Configuration — reset to defaults\n\n");
        for prop in ALL_PROPS {
            out.push_str(&format!("{}={}\n", prop.name, prop.default));
        }
        std::fs::write(&path, &out).map_err(|e| format!("Cannot reset config: {}", e))?;
        println!("configuration reset to defaults at {}", path.display());
        Ok(())
    }

    pub fn list(&self) {
        let mut by_category: Vec<&PropDef> = ALL_PROPS.iter().collect();
        by_category.sort_by_key(|p| format!("{:?}", p.category));

        let mut current_cat: Option<String> = None;
        for prop in by_category {
            let cat = format!("{}", prop.category);
            if current_cat.as_deref() != Some(cat.as_str()) {
                println!();
                println!("── {} ──────────────────────────────", cat);
                current_cat = Some(cat);
            }
            let current = self.get(prop.name).unwrap_or(prop.default);
            let marker = if current == prop.default { "  " } else { "* " };
            println!("{}{:<20} = {:<10} (default: {})", marker, prop.name, current, prop.default);
        }
        println!();
        println!("  * = overridden from default");
        println!(
            "  config file: {}",
            Self::config_path().map(|p| p.display().to_string()).unwrap_or_else(|| "N/A".into())
        );
    }

    pub fn describe(&self, key: &str) {
        match ALL_PROPS.iter().find(|p| p.name == key) {
            None => println!("unknown property: '{}'. Run `axiom conf list` to see all.", key),
            Some(p) => {
                let current = self.get(p.name).unwrap_or(p.default);
                println!("{} ({})", p.name, p.category);
                println!("  current: {}", current);
                println!("  default: {}", p.default);
                println!("  {}", p.description);
            }
        }
    }

    pub fn debug(&self) -> bool {
        self.get_bool("debug")
    }
    pub fn gc_verbose(&self) -> bool {
        self.get_bool("gc_verbose")
    }
    pub fn bounds_check(&self) -> bool {
        self.get_bool("bounds_check")
    }
    pub fn gc_growth_factor(&self) -> f64 {
        self.get_f64("gc_growth_factor", crate::gc::GC_GROWTH_FACTOR)
    }
    pub fn gc_min_threshold(&self) -> usize {
        self.get_usize("gc_min_threshold", crate::gc::MIN_GC_THRESHOLD)
    }
    pub fn gc_max_threshold(&self) -> usize {
        self.get_usize("gc_max_threshold", crate::gc::MAX_GC_THRESHOLD)
    }
    pub fn pool_min_size(&self) -> usize {
        self.get_usize("pool_min_size", crate::pool::MIN_POOL_SIZE)
    }
    pub fn max_call_depth(&self) -> u32 {
        self.get_u32("max_call_depth", 500)
    }
}

pub fn cmd_conf_set(spec: &str) -> Result<(), String> {
    let (key, value) = spec
        .split_once('=')
        .ok_or_else(|| "expected property=value".to_string())?;
    let mut conf = AxConf::load();
    conf.set(key.trim(), value.trim())
}

pub fn cmd_conf_get(key: &str) -> Result<(), String> {
    let conf = AxConf::load();
    match conf.get(key) {
        Some(v) => {
            println!("{}", v);
            Ok(())
        }
        None => Err(format!("unknown property: '{}'", key)),
    }
}

pub fn cmd_conf_list() {
    AxConf::load().list();
}

pub fn cmd_conf_reset() -> Result<(), String> {
    AxConf::reset()
}

pub fn cmd_conf_describe(key: &str) {
    AxConf::load().describe(key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_set_is_rejected() {
        let mut conf = AxConf { values: HashMap::new() };
        for prop in ALL_PROPS {
            conf.values.insert(prop.name.to_string(), prop.default.to_string());
        }
        assert!(conf.set("no_such_property", "on").is_err());
    }

    #[test]
    fn bool_parsing_accepts_common_truthy_spellings() {
        let mut values = HashMap::new();
        values.insert("debug".to_string(), "yes".to_string());
        let conf = AxConf { values };
        assert!(conf.get_bool("debug"));
    }

    #[test]
    fn numeric_defaults_fall_back_when_unset() {
        let conf = AxConf { values: HashMap::new() };
        assert_eq!(conf.get_u32("max_call_depth", 500), 500);
    }
}
