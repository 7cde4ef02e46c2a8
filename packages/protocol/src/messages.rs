//! Message definitions.

use std::collections::BTreeMap;

/// Identifies one in-flight transaction.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct TransactionContext {
    #[prost(string, tag = "1")]
    pub channel_id: String,
    #[prost(string, tag = "2")]
    pub transaction_id: String,
}

impl TransactionContext {
    pub fn new(channel_id: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            transaction_id: transaction_id.into(),
        }
    }
}

/// A key and its value.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct State {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

impl State {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Names a private collection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Collection {
    #[prost(string, tag = "1")]
    pub name: String,
}

impl Collection {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Common accessors for requests that act on ledger state.
pub trait LedgerRequest {
    /// The transaction the request belongs to.
    fn context(&self) -> Option<&TransactionContext>;

    /// The raw collection field.
    fn collection(&self) -> Option<&Collection>;

    /// The collection to act on, if any.
    ///
    /// An absent collection and an empty name are the same thing: world
    /// state.
    fn collection_name(&self) -> Option<&str> {
        self.collection()
            .map(|c| c.name.as_str())
            .filter(|name| !name.is_empty())
    }
}

macro_rules! ledger_request {
    ($($ty:ty),* $(,)?) => {
        $(
            impl LedgerRequest for $ty {
                fn context(&self) -> Option<&TransactionContext> {
                    self.context.as_ref()
                }

                fn collection(&self) -> Option<&Collection> {
                    self.collection.as_ref()
                }
            }
        )*
    };
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateStateRequest {
    #[prost(message, optional, tag = "1")]
    pub context: Option<TransactionContext>,
    #[prost(message, optional, tag = "2")]
    pub state: Option<State>,
    #[prost(message, optional, tag = "3")]
    pub collection: Option<Collection>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateStateRequest {
    #[prost(message, optional, tag = "1")]
    pub context: Option<TransactionContext>,
    #[prost(message, optional, tag = "2")]
    pub state: Option<State>,
    #[prost(message, optional, tag = "3")]
    pub collection: Option<Collection>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadStateRequest {
    #[prost(message, optional, tag = "1")]
    pub context: Option<TransactionContext>,
    #[prost(string, tag = "2")]
    pub state_key: String,
    #[prost(message, optional, tag = "3")]
    pub collection: Option<Collection>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadStateResponse {
    #[prost(message, optional, tag = "1")]
    pub state: Option<State>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExistsStateRequest {
    #[prost(message, optional, tag = "1")]
    pub context: Option<TransactionContext>,
    #[prost(string, tag = "2")]
    pub state_key: String,
    #[prost(message, optional, tag = "3")]
    pub collection: Option<Collection>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExistsStateResponse {
    #[prost(bool, tag = "1")]
    pub exists: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHashRequest {
    #[prost(message, optional, tag = "1")]
    pub context: Option<TransactionContext>,
    #[prost(string, tag = "2")]
    pub state_key: String,
    #[prost(message, optional, tag = "3")]
    pub collection: Option<Collection>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHashResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub hash: Vec<u8>,
}

/// Keys in `[start_key, end_key)`; empty means unbounded on that side.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyRangeQuery {
    #[prost(string, tag = "1")]
    pub start_key: String,
    #[prost(string, tag = "2")]
    pub end_key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStatesRequest {
    #[prost(message, optional, tag = "1")]
    pub context: Option<TransactionContext>,
    #[prost(oneof = "get_states_request::Query", tags = "2")]
    pub query: Option<get_states_request::Query>,
    #[prost(message, optional, tag = "3")]
    pub collection: Option<Collection>,
}

pub mod get_states_request {
    /// The kind of query to run.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Query {
        #[prost(message, tag = "2")]
        ByKeyRange(super::KeyRangeQuery),
    }
}

impl GetStatesRequest {
    /// A key range query over world state.
    pub fn by_key_range(
        context: TransactionContext,
        start_key: impl Into<String>,
        end_key: impl Into<String>,
    ) -> Self {
        Self {
            context: Some(context),
            query: Some(get_states_request::Query::ByKeyRange(KeyRangeQuery {
                start_key: start_key.into(),
                end_key: end_key.into(),
            })),
            collection: None,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStatesResponse {
    #[prost(message, repeated, tag = "1")]
    pub states: Vec<State>,
}

ledger_request!(
    CreateStateRequest,
    UpdateStateRequest,
    ReadStateRequest,
    ExistsStateRequest,
    GetHashRequest,
    GetStatesRequest,
);

/// Asks the guest to run one transaction function.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvokeTransactionRequest {
    #[prost(message, optional, tag = "1")]
    pub context: Option<TransactionContext>,
    #[prost(string, tag = "2")]
    pub transaction_name: String,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub args: Vec<Vec<u8>>,
    #[prost(btree_map = "string, bytes", tag = "4")]
    pub transient_args: BTreeMap<String, Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvokeTransactionResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, encode};
    use collection_literals::btree;

    #[test]
    fn collection_name_treats_empty_as_world_state() {
        let mut request = ReadStateRequest {
            context: Some(TransactionContext::new("ch", "tx")),
            state_key: "007".to_string(),
            collection: None,
        };
        assert_eq!(request.collection_name(), None);

        request.collection = Some(Collection::named(""));
        assert_eq!(request.collection_name(), None);

        request.collection = Some(Collection::named("secrets"));
        assert_eq!(request.collection_name(), Some("secrets"));
    }

    #[test]
    fn empty_collection_name_survives_the_wire_as_world_state() {
        let request = ExistsStateRequest {
            context: Some(TransactionContext::new("ch", "tx")),
            state_key: "007".to_string(),
            collection: Some(Collection::named("")),
        };
        let decoded: ExistsStateRequest = decode(&encode(&request)).unwrap();
        assert_eq!(decoded.collection_name(), None);
    }

    #[test]
    fn get_states_by_key_range() {
        let request =
            GetStatesRequest::by_key_range(TransactionContext::new("ch", "tx"), "001", "009");
        let decoded: GetStatesRequest = decode(&encode(&request)).unwrap();
        match &decoded.query {
            Some(get_states_request::Query::ByKeyRange(range)) => {
                assert_eq!(range.start_key, "001");
                assert_eq!(range.end_key, "009");
            }
            None => panic!("expected key range query"),
        }
        assert_eq!(decoded.context().unwrap().transaction_id, "tx");
    }

    #[test]
    fn invoke_request_carries_transient_args() {
        let request = InvokeTransactionRequest {
            context: Some(TransactionContext::new("ch", "tx")),
            transaction_name: "CreateAsset".to_string(),
            args: vec![b"007".to_vec(), b"bond".to_vec()],
            transient_args: btree! { "secret".to_string() => b"shaken".to_vec() },
        };
        let decoded: InvokeTransactionRequest = decode(&encode(&request)).unwrap();
        assert_eq!(decoded, request);
    }
}
