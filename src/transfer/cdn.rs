//! CDN 节点展开：把一个源地址换成各个已知节点上的等价地址。

use reqwest::Url;

pub const DEFAULT_CDN_NODES: [&str; 3] = [
    "r1-ndr-private.ykt.cbern.com.cn",
    "r2-ndr-private.ykt.cbern.com.cn",
    "r3-ndr-private.ykt.cbern.com.cn",
];

#[derive(Debug, Clone)]
pub struct CdnResolver {
    nodes: Vec<String>,
}

impl Default for CdnResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CDN_NODES.iter().map(|s| s.to_string()))
    }
}

impl CdnResolver {
    pub fn new(nodes: impl IntoIterator<Item = String>) -> Self {
        let mut list: Vec<String> = Vec::new();
        for node in nodes {
            let node = node.trim().to_ascii_lowercase();
            if !node.is_empty() && !list.contains(&node) {
                list.push(node);
            }
        }
        Self { nodes: list }
    }

    /// 候选地址列表，原地址总在第一位；其余按节点顺序排列，跳过原地址所在节点。
    /// 不属于任何已知节点的地址原样返回。
    pub fn candidates(&self, url: &str) -> Vec<String> {
        let Ok(parsed) = Url::parse(url) else {
            return vec![url.to_string()];
        };
        let Some(current) = self.node_of_url(&parsed) else {
            return vec![url.to_string()];
        };

        let mut out = vec![url.to_string()];
        for node in &self.nodes {
            if node == current {
                continue;
            }
            let mut alt = parsed.clone();
            if alt.set_host(Some(node)).is_err() {
                continue;
            }
            let alt = alt.to_string();
            if !out.contains(&alt) {
                out.push(alt);
            }
        }
        out
    }

    /// 地址所在的已知节点名；未知节点返回 `None`。
    #[cfg(test)]
    pub fn node_of(&self, url: &str) -> Option<&str> {
        let parsed = Url::parse(url).ok()?;
        self.node_of_url(&parsed)
    }

    fn node_of_url(&self, url: &Url) -> Option<&str> {
        let host = url.host_str()?;
        self.nodes
            .iter()
            .find(|n| n.eq_ignore_ascii_case(host))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const PDF: &str = "https://r2-ndr-private.ykt.cbern.com.cn/edu_product/esp/assets/abc.pkg/pdf.pdf";

    fn host(url: &str) -> String {
        Url::parse(url).unwrap().host_str().unwrap().to_string()
    }

    #[test]
    fn unknown_hosts_pass_through() {
        let cdn = CdnResolver::default();
        let url = "https://s-file-1.ykt.cbern.com.cn/zxx/x.json";
        assert_eq!(cdn.candidates(url), vec![url.to_string()]);
        assert_eq!(cdn.candidates("not a url"), vec!["not a url".to_string()]);
        assert_eq!(cdn.node_of(url), None);
    }

    #[test]
    fn original_first_then_other_nodes_in_order() {
        let cdn = CdnResolver::default();
        let list = cdn.candidates(PDF);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0], PDF);
        assert_eq!(host(&list[1]), "r1-ndr-private.ykt.cbern.com.cn");
        assert_eq!(host(&list[2]), "r3-ndr-private.ykt.cbern.com.cn");
        assert!(list[1].ends_with("/edu_product/esp/assets/abc.pkg/pdf.pdf"));
    }

    #[test]
    fn expansion_is_stable_from_any_candidate() {
        let cdn = CdnResolver::default();
        let first = cdn.candidates(PDF);
        for url in &first {
            let again = cdn.candidates(url);
            assert_eq!(again.len(), first.len());
            assert_eq!(&again[0], url);
            let hosts: HashSet<String> = again.iter().map(|u| host(u)).collect();
            assert_eq!(hosts.len(), again.len());
        }
    }

    #[test]
    fn duplicate_node_configuration_is_collapsed() {
        let cdn = CdnResolver::new(
            ["a.example", "B.example", "a.example", " "]
                .iter()
                .map(|s| s.to_string()),
        );
        let list = cdn.candidates("https://b.example/x?y=1");
        assert_eq!(
            list,
            vec!["https://b.example/x?y=1".to_string(), "https://a.example/x?y=1".to_string()]
        );
        assert_eq!(cdn.node_of("https://a.example/x"), Some("a.example"));
    }
}
