//! 网络访问：HTTP 客户端封装与测试替身的接口。

pub mod http;
