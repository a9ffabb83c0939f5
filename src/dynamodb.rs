use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::retry::RetryConfig as SdkRetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::config::http::HttpResponse;
use aws_sdk_dynamodb::config::{ProvideCredentials, SharedCredentialsProvider};
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{AttributeValue as SdkAttributeValue, PutRequest, WriteRequest};

use crate::codec::{AttributeValue, Item};
use crate::config::StoreConfig;
use crate::error::{Result, UserStoreError};
use crate::transport::{ItemStore, ScanPage, ScanRequest, TransportError, UpdateRequest};

/// DynamoDB-backed item store. The SDK's own retries are disabled; every
/// call here is a single request.
#[derive(Clone)]
pub struct DynamoStore {
    client: Client,
}

impl DynamoStore {
    /// Resolve region and credentials and build the SDK client
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).retry_config(SdkRetryConfig::disabled());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(url) = &config.endpoint_url {
            loader = loader.endpoint_url(url.clone());
        }
        let sdk_config = loader.load().await;

        let region = sdk_config.region().ok_or_else(|| {
            UserStoreError::Config("unable to resolve an AWS region".to_string())
        })?;
        resolve_credentials(sdk_config.credentials_provider()).await?;

        tracing::info!(
            region = %region,
            endpoint = config.endpoint_url.as_deref().unwrap_or("default"),
            "DynamoDB client configured"
        );

        Ok(Self {
            client: Client::new(&sdk_config),
        })
    }
}

/// Resolve credentials once so a missing chain fails at startup, not on the first request
async fn resolve_credentials(provider: Option<SharedCredentialsProvider>) -> Result<()> {
    let provider = provider.ok_or_else(|| {
        UserStoreError::Config("no AWS credentials provider configured".to_string())
    })?;
    provider
        .provide_credentials()
        .await
        .map_err(|e| UserStoreError::Config(format!("unable to resolve AWS credentials: {e}")))?;
    Ok(())
}

#[async_trait]
impl ItemStore for DynamoStore {
    async fn put_item(&self, table: &str, item: Item) -> std::result::Result<(), TransportError> {
        self.client
            .put_item()
            .table_name(table)
            .set_item(Some(to_sdk_item(item)))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_item(
        &self,
        table: &str,
        key: Item,
    ) -> std::result::Result<Option<Item>, TransportError> {
        let output = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(to_sdk_item(key)))
            .send()
            .await
            .map_err(classify)?;
        Ok(output.item().cloned().map(from_sdk_item))
    }

    async fn update_item(
        &self,
        table: &str,
        key: Item,
        update: UpdateRequest,
    ) -> std::result::Result<(), TransportError> {
        let (expression, values) = set_expression(update.set);
        self.client
            .update_item()
            .table_name(table)
            .set_key(Some(to_sdk_item(key)))
            .update_expression(expression)
            .set_condition_expression(
                update
                    .require_existing
                    .map(|attribute| format!("attribute_exists({attribute})")),
            )
            .set_expression_attribute_values(Some(values))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_item(&self, table: &str, key: Item) -> std::result::Result<(), TransportError> {
        self.client
            .delete_item()
            .table_name(table)
            .set_key(Some(to_sdk_item(key)))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn scan(
        &self,
        table: &str,
        request: ScanRequest,
    ) -> std::result::Result<ScanPage, TransportError> {
        let mut builder = self
            .client
            .scan()
            .table_name(table)
            .set_exclusive_start_key(request.exclusive_start_key.map(to_sdk_item))
            .set_limit(request.limit);
        if let Some(filter) = request.filter {
            let placeholder = placeholder(&filter.attribute);
            builder = builder
                .filter_expression(format!("{} = {placeholder}", filter.attribute))
                .expression_attribute_values(placeholder, to_sdk(filter.value));
        }

        let output = builder.send().await.map_err(classify)?;
        Ok(ScanPage {
            items: output.items().iter().cloned().map(from_sdk_item).collect(),
            last_evaluated_key: output.last_evaluated_key().cloned().map(from_sdk_item),
        })
    }

    async fn batch_put(
        &self,
        table: &str,
        items: Vec<Item>,
    ) -> std::result::Result<Vec<Item>, TransportError> {
        let requests = items
            .into_iter()
            .map(|item| {
                PutRequest::builder()
                    .set_item(Some(to_sdk_item(item)))
                    .build()
                    .map(|put| WriteRequest::builder().put_request(put).build())
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TransportError::construction(e.to_string()))?;

        let output = self
            .client
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
            .map_err(classify)?;

        let unprocessed = output
            .unprocessed_items()
            .and_then(|tables| tables.get(table))
            .map(|requests| {
                requests
                    .iter()
                    .filter_map(WriteRequest::put_request)
                    .map(|put| from_sdk_item(put.item().clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(unprocessed)
    }
}

/// `:name` placeholder for an attribute
fn placeholder(attribute: &str) -> String {
    format!(":{}", attribute.to_lowercase())
}

/// Render `SET A = :a, B = :b` and its value map
fn set_expression(
    set: Vec<(String, AttributeValue)>,
) -> (String, HashMap<String, SdkAttributeValue>) {
    let mut clauses = Vec::with_capacity(set.len());
    let mut values = HashMap::with_capacity(set.len());
    for (attribute, value) in set {
        let placeholder = placeholder(&attribute);
        clauses.push(format!("{attribute} = {placeholder}"));
        values.insert(placeholder, to_sdk(value));
    }
    (format!("SET {}", clauses.join(", ")), values)
}

fn classify<E>(err: SdkError<E, HttpResponse>) -> TransportError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) => TransportError::timeout(message),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => {
            TransportError::timeout(message)
        }
        SdkError::DispatchFailure(failure) if failure.is_io() => TransportError::dispatch(message),
        // identity resolution, user and unknown connector failures do not heal on resend
        SdkError::DispatchFailure(_) => TransportError::construction(message),
        SdkError::ConstructionFailure(_) => TransportError::construction(message),
        SdkError::ResponseError(context) => {
            TransportError::response(Some(context.raw().status().as_u16()), message)
        }
        SdkError::ServiceError(context) => {
            let status = Some(context.raw().status().as_u16());
            match context.err().code() {
                Some(code) => TransportError::service(code, status, message),
                None => TransportError::response(status, message),
            }
        }
        _ => TransportError::response(None, message),
    }
}

pub fn to_sdk(value: AttributeValue) -> SdkAttributeValue {
    match value {
        AttributeValue::S(s) => SdkAttributeValue::S(s),
        AttributeValue::N(n) => SdkAttributeValue::N(n),
        AttributeValue::B(b) => SdkAttributeValue::B(Blob::new(b)),
        AttributeValue::Bool(b) => SdkAttributeValue::Bool(b),
        AttributeValue::Null => SdkAttributeValue::Null(true),
        AttributeValue::L(list) => SdkAttributeValue::L(list.into_iter().map(to_sdk).collect()),
        AttributeValue::M(map) => SdkAttributeValue::M(to_sdk_item(map)),
        AttributeValue::Ss(set) => SdkAttributeValue::Ss(set),
        AttributeValue::Ns(set) => SdkAttributeValue::Ns(set),
        AttributeValue::Bs(set) => SdkAttributeValue::Bs(set.into_iter().map(Blob::new).collect()),
    }
}

pub fn from_sdk(value: SdkAttributeValue) -> AttributeValue {
    match value {
        SdkAttributeValue::S(s) => AttributeValue::S(s),
        SdkAttributeValue::N(n) => AttributeValue::N(n),
        SdkAttributeValue::B(b) => AttributeValue::B(b.into_inner()),
        SdkAttributeValue::Bool(b) => AttributeValue::Bool(b),
        SdkAttributeValue::L(list) => AttributeValue::L(list.into_iter().map(from_sdk).collect()),
        SdkAttributeValue::M(map) => AttributeValue::M(from_sdk_item(map)),
        SdkAttributeValue::Ss(set) => AttributeValue::Ss(set),
        SdkAttributeValue::Ns(set) => AttributeValue::Ns(set),
        SdkAttributeValue::Bs(set) => {
            AttributeValue::Bs(set.into_iter().map(Blob::into_inner).collect())
        }
        // NULL and variants newer than this client
        _ => AttributeValue::Null,
    }
}

fn to_sdk_item(item: Item) -> HashMap<String, SdkAttributeValue> {
    item.into_iter().map(|(k, v)| (k, to_sdk(v))).collect()
}

fn from_sdk_item(item: HashMap<String, SdkAttributeValue>) -> Item {
    item.into_iter().map(|(k, v)| (k, from_sdk(v))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, ACTIVE, AGE, EMAIL};
    use crate::config::RetryConfig;
    use crate::models::User;
    use crate::retry::RetryPolicy;
    use crate::transport::TransportErrorKind;
    use aws_credential_types::credential_fn::provide_credentials_fn;
    use aws_credential_types::provider::error::CredentialsError;
    use aws_sdk_dynamodb::config::Credentials;
    use aws_sdk_dynamodb::error::ConnectorError;
    use aws_sdk_dynamodb::operation::get_item::GetItemError;

    fn dispatch_failure(failure: ConnectorError) -> TransportError {
        classify(SdkError::<GetItemError, HttpResponse>::dispatch_failure(failure))
    }

    #[test]
    fn test_classify_dispatch_failures() {
        let policy = RetryPolicy::new(RetryConfig::default()).unwrap();

        let io = dispatch_failure(ConnectorError::io("connection reset by peer".into()));
        assert_eq!(io.kind, TransportErrorKind::Dispatch);
        assert!(policy.is_retryable(&io));

        let timeout = dispatch_failure(ConnectorError::timeout("read timed out".into()));
        assert_eq!(timeout.kind, TransportErrorKind::Timeout);
        assert!(policy.is_retryable(&timeout));

        let identity =
            dispatch_failure(ConnectorError::other("no credentials in the chain".into(), None));
        assert_eq!(identity.kind, TransportErrorKind::Construction);
        assert!(!policy.is_retryable(&identity));
        assert!(matches!(
            policy.decide(1, &identity),
            crate::retry::RetryDecision::Stop(crate::retry::StopReason::NotRetryable)
        ));

        let user = dispatch_failure(ConnectorError::user("invalid request body".into()));
        assert_eq!(user.kind, TransportErrorKind::Construction);
        assert!(!policy.is_retryable(&user));
    }

    #[test]
    fn test_classify_sdk_timeout() {
        let err = classify(SdkError::<GetItemError, HttpResponse>::timeout_error(
            "operation timed out",
        ));
        assert_eq!(err.kind, TransportErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_unresolvable_credentials_are_config_error() {
        let empty = SharedCredentialsProvider::new(provide_credentials_fn(|| async {
            Err(CredentialsError::not_loaded("no providers in chain"))
        }));
        assert!(matches!(
            resolve_credentials(Some(empty)).await,
            Err(UserStoreError::Config(_))
        ));
        assert!(matches!(
            resolve_credentials(None).await,
            Err(UserStoreError::Config(_))
        ));

        let stat = SharedCredentialsProvider::new(Credentials::new(
            "AKIDEXAMPLE",
            "secret",
            None,
            None,
            "static",
        ));
        assert!(resolve_credentials(Some(stat)).await.is_ok());
    }

    #[test]
    fn test_sdk_conversion_is_lossless() {
        let nested = AttributeValue::M(Item::from([
            ("tags".to_string(), AttributeValue::Ss(vec!["a".into(), "b".into()])),
            ("blob".to_string(), AttributeValue::B(vec![0, 1, 2])),
            ("none".to_string(), AttributeValue::Null),
            (
                "list".to_string(),
                AttributeValue::L(vec![AttributeValue::N("1.5".into()), AttributeValue::Bool(false)]),
            ),
        ]));
        assert_eq!(from_sdk(to_sdk(nested.clone())), nested);

        let item = codec::encode(&User::new("user123", "John Doe", "john@example.com", 30, true));
        assert_eq!(from_sdk_item(to_sdk_item(item.clone())), item);
    }

    #[test]
    fn test_set_expression_matches_update_shape() {
        let (expression, values) = set_expression(vec![
            (EMAIL.to_string(), AttributeValue::S("john.doe@example.com".into())),
            (AGE.to_string(), AttributeValue::N("31".into())),
        ]);
        assert_eq!(expression, "SET Email = :email, Age = :age");
        assert_eq!(
            values.get(":email"),
            Some(&SdkAttributeValue::S("john.doe@example.com".into()))
        );
        assert_eq!(values.get(":age"), Some(&SdkAttributeValue::N("31".into())));
    }

    #[test]
    fn test_placeholder() {
        assert_eq!(placeholder(ACTIVE), ":active");
    }
}
