//! YAML 配置文件：首次运行生成带注释的默认配置，之后把用户值合并到默认值上。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读写配置文件失败 {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("配置文件不是合法的 YAML {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("配置无效: {0}")]
    Validation(String),
}

/// 配置字段的名字与写入文件时附带的注释。
#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub name: &'static str,
    pub description: &'static str,
}

pub trait ConfigSpec: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;

    /// 按写入顺序排列的字段表。
    fn fields() -> &'static [FieldMeta];

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// 读取配置；文件不存在时写入默认配置。
///
/// `path` 为 `None` 时使用当前目录下的 `T::FILE_NAME`。用户文件缺少字段时，
/// 会用合并后的完整配置重写文件，新字段因此带着注释出现。
pub fn load_or_create<T: ConfigSpec>(path: Option<&Path>) -> Result<T, ConfigError> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(T::FILE_NAME));

    if !path.exists() {
        let config = T::default();
        write_with_comments(&config, &path)?;
        return Ok(config);
    }

    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let user: Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;
    let incomplete = missing_fields::<T>(&user);

    let mut merged =
        serde_yaml::to_value(T::default()).map_err(|e| ConfigError::Validation(e.to_string()))?;
    merge_values(&mut merged, user);
    let config: T =
        serde_yaml::from_value(merged).map_err(|e| ConfigError::Validation(e.to_string()))?;
    config.validate().map_err(ConfigError::Validation)?;

    if incomplete {
        write_with_comments(&config, &path)?;
    }
    Ok(config)
}

pub fn write_with_comments<T: ConfigSpec>(config: &T, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let yaml = render_with_comments(config)?;
    fs::write(path, yaml).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn render_with_comments<T: ConfigSpec>(config: &T) -> Result<String, ConfigError> {
    let Value::Mapping(mapping) =
        serde_yaml::to_value(config).map_err(|e| ConfigError::Validation(e.to_string()))?
    else {
        return Err(ConfigError::Validation("配置必须序列化为映射".to_string()));
    };

    let mut out = String::new();
    for field in T::fields() {
        for line in field.description.lines() {
            out.push_str("# ");
            out.push_str(line);
            out.push('\n');
        }
        let key = Value::String(field.name.to_string());
        let val = mapping.get(&key).cloned().unwrap_or(Value::Null);
        let entry = serde_yaml::to_string(&Mapping::from_iter([(key, val)]))
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        out.push_str(entry.trim_end());
        out.push_str("\n\n");
    }
    Ok(out)
}

fn missing_fields<T: ConfigSpec>(user: &Value) -> bool {
    let Value::Mapping(map) = user else {
        return true;
    };
    T::fields()
        .iter()
        .any(|f| !map.contains_key(Value::String(f.name.to_string())))
}

fn merge_values(default: &mut Value, user: Value) {
    match (default, user) {
        (Value::Mapping(dest), Value::Mapping(src)) => {
            for (key, user_val) in src {
                match dest.get_mut(&key) {
                    Some(dest_val) => merge_values(dest_val, user_val),
                    None => {
                        dest.insert(key, user_val);
                    }
                }
            }
        }
        // 空文件解析为 null，保留默认值
        (_, Value::Null) => {}
        (dest, other) => *dest = other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Sample {
        workers: usize,
        label: String,
        nodes: Vec<String>,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                workers: 3,
                label: "默认".to_string(),
                nodes: vec!["a".to_string(), "b".to_string()],
            }
        }
    }

    impl ConfigSpec for Sample {
        const FILE_NAME: &'static str = "sample.yml";

        fn fields() -> &'static [FieldMeta] {
            &[
                FieldMeta {
                    name: "workers",
                    description: "并发数",
                },
                FieldMeta {
                    name: "label",
                    description: "名称\n第二行说明",
                },
                FieldMeta {
                    name: "nodes",
                    description: "",
                },
            ]
        }

        fn validate(&self) -> Result<(), String> {
            if self.workers == 0 {
                return Err("workers 必须大于 0".to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn creates_commented_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("sample.yml");
        let cfg: Sample = load_or_create(Some(&path)).unwrap();
        assert_eq!(cfg, Sample::default());
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("# 并发数\nworkers: 3"));
        assert!(text.contains("# 名称\n# 第二行说明\nlabel: 默认"));
        let reread: Sample = load_or_create(Some(&path)).unwrap();
        assert_eq!(reread, cfg);
    }

    #[test]
    fn user_values_override_and_missing_fields_are_filled_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.yml");
        fs::write(&path, "workers: 8\nnodes: [x]\n").unwrap();
        let cfg: Sample = load_or_create(Some(&path)).unwrap();
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.nodes, vec!["x".to_string()]);
        assert_eq!(cfg.label, "默认");
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("label: 默认"));
        assert!(text.contains("workers: 8"));
    }

    #[test]
    fn invalid_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.yml");
        fs::write(&path, "workers: [unclosed\n").unwrap();
        assert!(matches!(
            load_or_create::<Sample>(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
        fs::write(&path, "workers: 0\n").unwrap();
        assert!(matches!(
            load_or_create::<Sample>(Some(&path)),
            Err(ConfigError::Validation(_))
        ));
    }
}
