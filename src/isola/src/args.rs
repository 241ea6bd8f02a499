//! Run arguments and their wire encoding.
//!
//! Host-supplied arguments are a tagged variant: a JSON value or a stream
//! of JSON values, either one optionally named. Unnamed arguments are
//! positional in declaration order.

use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::stream::JsonStream;

/// One argument to [`Sandbox::run`].
///
/// [`Sandbox::run`]: crate::Sandbox::run
#[derive(Debug)]
pub enum RunArg {
    /// A JSON value, serialized compactly at encode time.
    Json {
        /// Optional binding name; `None` means positional.
        name: Option<String>,
        /// The value itself.
        value: serde_json::Value,
    },
    /// A stream of JSON payloads the guest iterates.
    Stream {
        /// Optional binding name; `None` means positional.
        name: Option<String>,
        /// The channel carrying the payloads.
        stream: JsonStream,
        /// Host-side producer task feeding the channel, if any. The run
        /// orchestrator joins it on success and aborts it on failure.
        producer: Option<JoinHandle<Result<()>>>,
    },
}

impl RunArg {
    /// A positional JSON argument from any serializable value.
    ///
    /// # Errors
    ///
    /// Fails when the value cannot be represented as JSON.
    pub fn value<T: Serialize>(value: &T) -> Result<Self> {
        Ok(RunArg::Json {
            name: None,
            value: serde_json::to_value(value)?,
        })
    }

    /// A named JSON argument from any serializable value.
    ///
    /// # Errors
    ///
    /// Fails when the value cannot be represented as JSON.
    pub fn named<T: Serialize>(name: impl Into<String>, value: &T) -> Result<Self> {
        Ok(RunArg::Json {
            name: Some(name.into()),
            value: serde_json::to_value(value)?,
        })
    }

    /// A positional stream argument over an already-constructed channel.
    pub fn stream(stream: JsonStream) -> Self {
        RunArg::Stream {
            name: None,
            stream,
            producer: None,
        }
    }

    /// A named stream argument over an already-constructed channel.
    pub fn named_stream(name: impl Into<String>, stream: JsonStream) -> Self {
        RunArg::Stream {
            name: Some(name.into()),
            stream,
            producer: None,
        }
    }

    /// A stream argument fed from an async source.
    ///
    /// Spawns a producer task that serializes each item and pushes it with
    /// blocking-mode backpressure, ending the channel when the source is
    /// exhausted (or when pushing fails because the run tore the channel
    /// down first). Must be called from within a tokio runtime.
    pub fn stream_from<S, T>(source: S, capacity: usize) -> Result<Self>
    where
        S: futures::Stream<Item = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let stream = JsonStream::new(capacity)?;
        let producer_stream = stream.clone();
        let producer = tokio::spawn(async move {
            let result = async {
                futures::pin_mut!(source);
                while let Some(item) = source.next().await {
                    let payload = serde_json::to_string(&item)?;
                    let push_target = producer_stream.clone();
                    tokio::task::spawn_blocking(move || push_target.push_json(payload, true))
                        .await
                        .map_err(|e| {
                            crate::error::IsolaError::internal(format!(
                                "stream producer worker failed: {e}"
                            ))
                        })??;
                }
                Ok(())
            }
            .await;
            producer_stream.end();
            result
        });
        Ok(RunArg::Stream {
            name: None,
            stream,
            producer: Some(producer),
        })
    }

    /// Attach a name to this argument.
    pub fn with_name(mut self, new_name: impl Into<String>) -> Self {
        match &mut self {
            RunArg::Json { name, .. } | RunArg::Stream { name, .. } => {
                *name = Some(new_name.into());
            }
        }
        self
    }
}

impl From<serde_json::Value> for RunArg {
    fn from(value: serde_json::Value) -> Self {
        RunArg::Json { name: None, value }
    }
}

/// A wire-ready argument entry. Stream handles are assigned by the guest
/// instance's stream table just before the call.
#[derive(Debug)]
pub(crate) enum ArgEntry {
    Json {
        name: Option<String>,
        json: String,
    },
    Stream {
        name: Option<String>,
        stream: JsonStream,
    },
}

/// The encoder's output: entries in declaration order, plus the producer
/// tasks surrendered to the orchestrator.
#[derive(Debug, Default)]
pub(crate) struct EncodedArgs {
    pub(crate) entries: Vec<ArgEntry>,
    pub(crate) producers: Vec<JoinHandle<Result<()>>>,
    pub(crate) streams: Vec<JsonStream>,
}

/// Normalize run arguments into their wire form.
pub(crate) fn encode_args(args: Vec<RunArg>) -> Result<EncodedArgs> {
    let mut encoded = EncodedArgs::default();
    for arg in args {
        match arg {
            RunArg::Json { name, value } => {
                encoded.entries.push(ArgEntry::Json {
                    name,
                    json: serde_json::to_string(&value)?,
                });
            }
            RunArg::Stream {
                name,
                stream,
                producer,
            } => {
                encoded.streams.push(stream.clone());
                encoded.entries.push(ArgEntry::Stream { name, stream });
                if let Some(producer) = producer {
                    encoded.producers.push(producer);
                }
            }
        }
    }
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn positional_json_is_compact() {
        let encoded = encode_args(vec![
            json!(1).into(),
            json!({"a": [1, 2], "b": "x"}).into(),
        ])
        .unwrap();
        assert_eq!(encoded.entries.len(), 2);
        match &encoded.entries[1] {
            ArgEntry::Json { name, json } => {
                assert!(name.is_none());
                assert_eq!(json, r#"{"a":[1,2],"b":"x"}"#);
            }
            other => panic!("expected json entry, got {other:?}"),
        }
        assert!(encoded.producers.is_empty());
        assert!(encoded.streams.is_empty());
    }

    #[test]
    fn named_argument_keeps_its_name() {
        let encoded = encode_args(vec![RunArg::named("c", &5).unwrap()]).unwrap();
        match &encoded.entries[0] {
            ArgEntry::Json { name, json } => {
                assert_eq!(name.as_deref(), Some("c"));
                assert_eq!(json, "5");
            }
            other => panic!("expected json entry, got {other:?}"),
        }
    }

    #[test]
    fn stream_args_surrender_their_streams() {
        let stream = JsonStream::from_values([1, 2]).unwrap();
        let encoded = encode_args(vec![
            RunArg::named_stream("items", stream),
            json!(true).into(),
        ])
        .unwrap();
        assert_eq!(encoded.streams.len(), 1);
        assert!(matches!(
            &encoded.entries[0],
            ArgEntry::Stream { name: Some(n), .. } if n == "items"
        ));
    }

    #[tokio::test]
    async fn producer_feeds_and_ends_the_channel() {
        let arg = RunArg::stream_from(futures::stream::iter([1, 2, 3]), 4).unwrap();
        let RunArg::Stream {
            stream, producer, ..
        } = arg
        else {
            panic!("expected stream arg");
        };

        let consumer = {
            let stream = stream.clone();
            tokio::task::spawn_blocking(move || {
                std::iter::from_fn(|| stream.take()).collect::<Vec<_>>()
            })
        };
        producer.unwrap().await.unwrap().unwrap();
        assert_eq!(consumer.await.unwrap(), vec!["1", "2", "3"]);
        assert!(stream.is_ended());
    }

    #[tokio::test]
    async fn producer_survives_teardown_of_the_channel() {
        // A run that fails ends the channel before the producer is done; the
        // producer must terminate rather than hang.
        let arg = RunArg::stream_from(futures::stream::iter(0..1000), 1).unwrap();
        let RunArg::Stream {
            stream, producer, ..
        } = arg
        else {
            panic!("expected stream arg");
        };
        stream.end();
        let result = producer.unwrap().await.unwrap();
        assert!(matches!(
            result,
            Err(crate::error::IsolaError::StreamClosed) | Ok(())
        ));
    }
}
