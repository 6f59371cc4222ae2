#![allow(unused_imports)]

pub(crate) use anyhow::{Context, Result, anyhow, bail};
pub(crate) use async_trait::async_trait;
pub(crate) use chrono::{DateTime, Utc};
pub(crate) use futures::{FutureExt, StreamExt, TryStreamExt, future::BoxFuture, stream::BoxStream};
pub(crate) use serde::{Deserialize, Serialize};
pub(crate) use std::collections::{BTreeMap, HashMap};
pub(crate) use std::sync::{Arc, Mutex};
pub(crate) use tokio_util::sync::CancellationToken;

pub(crate) use tracing::{debug, error, info, info_span, instrument, trace, warn};
