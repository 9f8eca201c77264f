// @generated
// Generated from: proto/dns.proto
// Manual check-in for offline builds.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Zone {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(map = "string, message", tag = "2")]
    pub locations: ::std::collections::HashMap<::prost::alloc::string::String, Record>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Record {
    #[prost(message, repeated, tag = "1")]
    pub a: ::prost::alloc::vec::Vec<record::A>,
    #[prost(message, repeated, tag = "2")]
    pub aaaa: ::prost::alloc::vec::Vec<record::Aaaa>,
    #[prost(message, repeated, tag = "3")]
    pub cname: ::prost::alloc::vec::Vec<record::Cname>,
    #[prost(message, repeated, tag = "4")]
    pub txt: ::prost::alloc::vec::Vec<record::Txt>,
}

/// Nested message and enum types in `Record`.
pub mod record {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct A {
        #[prost(string, tag = "1")]
        pub ip: ::prost::alloc::string::String,
        #[prost(int64, tag = "2")]
        pub ttl: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Aaaa {
        #[prost(string, tag = "1")]
        pub ip: ::prost::alloc::string::String,
        #[prost(int64, tag = "2")]
        pub ttl: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Cname {
        #[prost(string, tag = "1")]
        pub host: ::prost::alloc::string::String,
        #[prost(int64, tag = "2")]
        pub ttl: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Txt {
        #[prost(string, tag = "1")]
        pub text: ::prost::alloc::string::String,
        #[prost(int64, tag = "2")]
        pub ttl: i64,
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PutResult {
    #[prost(int64, tag = "1")]
    pub result: i64,
}

pub mod dns_client {
    #![allow(clippy::derive_partial_eq_without_eq)]
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct DnsClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl<T> DnsClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::ResponseBody: Body + Send + 'static,
        T::Error: Into<StdError>,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
        <T::ResponseBody as Body>::Data: Into<Bytes> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub async fn get(
            &mut self,
            request: impl tonic::IntoRequest<super::Zone>,
        ) -> Result<tonic::Response<super::Zone>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                tonic::codegen::http::uri::PathAndQuery::from_static("/nocloud.dns.DNS/Get");
            self.inner.unary(request.into_request(), path, codec).await
        }

        pub async fn put(
            &mut self,
            request: impl tonic::IntoRequest<super::Zone>,
        ) -> Result<tonic::Response<super::PutResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                tonic::codegen::http::uri::PathAndQuery::from_static("/nocloud.dns.DNS/Put");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
}
