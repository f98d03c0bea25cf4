//! MongoDB adapter (feature `store-mongodb`), using the official async driver.
//!
//! Every worker gets its own `Client` with a single-connection pool, so one
//! harness worker maps to one server connection.
use crate::query::{DateRange, QuerySpec};
use crate::store::{ConnectOptions, Connection, QueryOutcome, Store, StoreError, WorkerId};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use futures::TryStreamExt;
use mongodb::bson::{Bson, DateTime, Document, doc};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use std::sync::Arc;

const DEFAULT_DATABASE: &str = "smart_home_data";
const DEFAULT_COLLECTION: &str = "power_readings";

pub struct MongoStore {
    uri: String,
    database: String,
    collection: String,
    app_name: String,
}

pub fn open(opts: &ConnectOptions) -> Result<Arc<dyn Store>, StoreError> {
    let uri = opts
        .get("uri")
        .filter(|u| !u.is_empty())
        .ok_or_else(|| StoreError::Connect("mongodb descriptor is missing `uri`".into()))?;
    Ok(Arc::new(MongoStore {
        uri: uri.to_string(),
        database: opts.get("database").unwrap_or(DEFAULT_DATABASE).to_string(),
        collection: opts.get("collection").unwrap_or(DEFAULT_COLLECTION).to_string(),
        app_name: opts.get("app_name").unwrap_or("store-bench").to_string(),
    }))
}

#[async_trait::async_trait]
impl Store for MongoStore {
    fn name(&self) -> &str {
        "mongodb"
    }

    async fn connect(&self, worker_id: WorkerId) -> Result<Box<dyn Connection>, StoreError> {
        let mut options = ClientOptions::parse(&self.uri).await.map_err(map_error)?;
        options.app_name = Some(format!("{}-w{}", self.app_name, worker_id));
        options.max_pool_size = Some(1);
        let client = Client::with_options(options).map_err(map_error)?;
        let collection = client
            .database(&self.database)
            .collection::<Document>(&self.collection);
        Ok(Box::new(MongoConnection { client, collection }))
    }
}

struct MongoConnection {
    client: Client,
    collection: Collection<Document>,
}

#[async_trait::async_trait]
impl Connection for MongoConnection {
    async fn execute(&mut self, spec: &QuerySpec) -> Result<QueryOutcome, StoreError> {
        let cursor = match spec {
            QuerySpec::RecentReadings { since, limit } => self
                .collection
                .find(doc! { "timestamp": { "$gt": bson_date(*since) } })
                .projection(doc! { "device_id": 1, "current_power": 1, "timestamp": 1, "_id": 0 })
                .limit(i64::from(*limit))
                .await
                .map_err(map_error)?,
            other => self
                .collection
                .aggregate(pipeline(other, self.collection.name()))
                .await
                .map_err(map_error)?,
        };
        let docs: Vec<Document> = cursor.try_collect().await.map_err(map_error)?;
        Ok(QueryOutcome {
            documents: docs.len() as u64,
        })
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        self.client.shutdown().await;
        Ok(())
    }
}

/// Render an aggregation-backed query as a pipeline. `collection` is the
/// target of self-joins.
pub fn pipeline(spec: &QuerySpec, collection: &str) -> Vec<Document> {
    match spec {
        QuerySpec::DevicePowerSummary {
            range,
            sample_size,
            min_count,
            limit,
            ..
        } => vec![
            doc! { "$match": { "timestamp": range_filter(range) } },
            doc! { "$sample": { "size": i64::from(*sample_size) } },
            doc! { "$group": {
                "_id": "$device_id.Device",
                "avgPower": { "$avg": "$current_power" },
                "maxPower": { "$max": "$current_power" },
                "minPower": { "$min": "$current_power" },
                "count": { "$sum": 1 },
            } },
            doc! { "$match": { "count": { "$gt": i64::from(*min_count) } } },
            doc! { "$sort": { "avgPower": -1 } },
            doc! { "$limit": i64::from(*limit) },
        ],
        QuerySpec::CategoryCounts { range } => vec![
            doc! { "$match": { "timestamp": range_filter(range) } },
            doc! { "$group": { "_id": "$device_id.Category", "count": { "$sum": 1 } } },
            doc! { "$sort": { "count": -1 } },
        ],
        QuerySpec::PowerPercentiles { range, category } => vec![
            doc! { "$match": {
                "timestamp": range_filter(range),
                "device_id.Category": *category,
            } },
            doc! { "$group": {
                "_id": Bson::Null,
                "powerPercentiles": { "$percentile": {
                    "input": "$current_power",
                    "p": [0.5, 0.95],
                    "method": "approximate",
                } },
                "readings": { "$sum": 1 },
            } },
            doc! { "$project": {
                "_id": 0,
                "medianPower": { "$arrayElemAt": ["$powerPercentiles", 0] },
                "p95Power": { "$arrayElemAt": ["$powerPercentiles", 1] },
                "readings": 1,
            } },
        ],
        QuerySpec::DeviceAnomalyPercentiles { since, limit } => vec![
            doc! { "$match": { "timestamp": { "$gte": bson_date(*since) } } },
            doc! { "$group": {
                "_id": {
                    "device": "$device_id.Device",
                    "day": { "$dayOfMonth": "$timestamp" },
                    "month": { "$month": "$timestamp" },
                },
                "deviceInfo": { "$first": "$device_id" },
                "dailyAvgPower": { "$avg": "$current_power" },
                "dailyMaxPower": { "$max": "$current_power" },
            } },
            doc! { "$group": {
                "_id": "$_id.device",
                "deviceInfo": { "$first": "$deviceInfo" },
                "powerPercentiles": { "$percentile": {
                    "input": "$dailyAvgPower",
                    "p": [0.1, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99],
                    "method": "approximate",
                } },
                "maxPowerByDay": { "$push": {
                    "day": { "$concat": [
                        { "$toString": "$_id.month" },
                        "-",
                        { "$toString": "$_id.day" },
                    ] },
                    "maxPower": "$dailyMaxPower",
                } },
            } },
            doc! { "$lookup": {
                "from": collection,
                "let": { "deviceId": "$_id" },
                "pipeline": [
                    { "$match": { "$expr": { "$eq": ["$device_id.Device", "$$deviceId"] } } },
                    { "$group": {
                        "_id": { "hour": { "$hour": "$timestamp" } },
                        "hourlyAvgPower": { "$avg": "$current_power" },
                    } },
                    { "$sort": { "_id.hour": 1 } },
                ],
                "as": "hourlyPattern",
            } },
            doc! { "$addFields": {
                "p50": { "$arrayElemAt": ["$powerPercentiles", 2] },
                "p95": { "$arrayElemAt": ["$powerPercentiles", 5] },
                "dayOverP95Count": { "$size": { "$filter": {
                    "input": "$maxPowerByDay",
                    "as": "day",
                    "cond": { "$gt": [
                        "$$day.maxPower",
                        { "$arrayElemAt": ["$powerPercentiles", 5] },
                    ] },
                } } },
            } },
            doc! { "$sort": { "dayOverP95Count": -1 } },
            doc! { "$limit": i64::from(*limit) },
        ],
        QuerySpec::NameRegexAnomaly { pattern, limit } => vec![
            doc! { "$match": { "$expr": { "$regexMatch": {
                "input": { "$toString": "$device_id.Name" },
                "regex": *pattern,
            } } } },
            doc! { "$group": {
                "_id": {
                    "device": "$device_id.Device",
                    "hour": { "$hour": "$timestamp" },
                    "dayOfWeek": { "$dayOfWeek": "$timestamp" },
                },
                "readings": { "$push": {
                    "power": "$current_power",
                    "voltage": "$voltage",
                } },
                "avgPower": { "$avg": "$current_power" },
                "count": { "$sum": 1 },
            } },
            doc! { "$project": {
                "device": "$_id.device",
                "hour": "$_id.hour",
                "dayOfWeek": "$_id.dayOfWeek",
                "avgPower": 1,
                "count": 1,
                "voltageVariance": { "$stdDevPop": "$readings.voltage" },
                "anomalyScore": { "$divide": [
                    { "$stdDevPop": "$readings.power" },
                    { "$cond": [
                        { "$eq": [{ "$avg": "$readings.power" }, 0] },
                        0.001,
                        { "$avg": "$readings.power" },
                    ] },
                ] },
            } },
            doc! { "$addFields": {
                "isWeekend": { "$in": ["$dayOfWeek", [1, 7]] },
                "timeCategory": { "$switch": {
                    "branches": [
                        { "case": hour_between(7, 10), "then": "morning" },
                        { "case": hour_between(10, 17), "then": "daytime" },
                        { "case": hour_between(17, 23), "then": "evening" },
                    ],
                    "default": "night",
                } },
            } },
            doc! { "$group": {
                "_id": {
                    "device": "$device",
                    "timeCategory": "$timeCategory",
                    "isWeekend": "$isWeekend",
                },
                "avgPower": { "$avg": "$avgPower" },
                "avgAnomalyScore": { "$avg": "$anomalyScore" },
                "sampleCount": { "$sum": "$count" },
            } },
            doc! { "$sort": { "avgAnomalyScore": -1 } },
            doc! { "$limit": i64::from(*limit) },
        ],
        QuerySpec::RecentReadings { since, limit } => vec![
            doc! { "$match": { "timestamp": { "$gt": bson_date(*since) } } },
            doc! { "$limit": i64::from(*limit) },
        ],
    }
}

/// `$hour` in `[from, to)`.
fn hour_between(from: i32, to: i32) -> Document {
    doc! { "$and": [{ "$gte": ["$hour", from] }, { "$lt": ["$hour", to] }] }
}

fn range_filter(range: &DateRange) -> Document {
    doc! { "$gte": bson_date(range.start), "$lte": bson_date(range.end) }
}

fn bson_date(date: NaiveDate) -> DateTime {
    let midnight = Utc.from_utc_datetime(&date.and_time(NaiveTime::default()));
    DateTime::from_millis(midnight.timestamp_millis())
}

/// Map driver errors by kind; network-level kinds become recoverable errors.
fn map_error(err: MongoError) -> StoreError {
    match err.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. } => {
            StoreError::Disconnected(err.to_string())
        }
        ErrorKind::ServerSelection { .. } => StoreError::Timeout,
        ErrorKind::DnsResolve { .. } | ErrorKind::Authentication { .. } => {
            StoreError::Connect(err.to_string())
        }
        ErrorKind::InvalidArgument { .. } => StoreError::Other(err.to_string()),
        _ => StoreError::Query(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::RangeSpan;
    use crate::store::ErrorClass;
    use mongodb::error::CommandError;

    fn range() -> DateRange {
        DateRange {
            start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
        }
    }

    #[test]
    fn summary_pipeline_keeps_stage_order() {
        let spec = QuerySpec::DevicePowerSummary {
            range: range(),
            span: RangeSpan::Short,
            sample_size: 2000,
            min_count: 3,
            limit: 50,
        };
        assert_eq!(
            stage_names(&spec),
            ["$match", "$sample", "$group", "$match", "$sort", "$limit"]
        );
    }

    fn stage_names(spec: &QuerySpec) -> Vec<String> {
        pipeline(spec, "power_readings")
            .iter()
            .map(|d| d.keys().next().unwrap().clone())
            .collect()
    }

    #[test]
    fn anomaly_percentiles_pipeline_keeps_stage_order() {
        let spec = QuerySpec::DeviceAnomalyPercentiles {
            since: range().start,
            limit: 10,
        };
        assert_eq!(
            stage_names(&spec),
            ["$match", "$group", "$group", "$lookup", "$addFields", "$sort", "$limit"]
        );
        let stages = pipeline(&spec, "readings_copy");
        let lookup = stages[3].get_document("$lookup").unwrap();
        assert_eq!(lookup.get_str("from").unwrap(), "readings_copy");
        assert_eq!(stages[6].get_i64("$limit").unwrap(), 10);
    }

    #[test]
    fn regex_anomaly_pipeline_keeps_stage_order() {
        let spec = QuerySpec::NameRegexAnomaly {
            pattern: ".*[Oo]ven.*",
            limit: 5,
        };
        assert_eq!(
            stage_names(&spec),
            ["$match", "$group", "$project", "$addFields", "$group", "$sort", "$limit"]
        );
        let stages = pipeline(&spec, "power_readings");
        let regex = stages[0]
            .get_document("$match")
            .and_then(|m| m.get_document("$expr"))
            .and_then(|e| e.get_document("$regexMatch"))
            .unwrap();
        assert_eq!(regex.get_str("regex").unwrap(), ".*[Oo]ven.*");
    }

    #[test]
    fn driver_errors_classify_by_kind() {
        let store = open(&ConnectOptions::default().with("uri", "mongodb://localhost:27017")).unwrap();

        let reset = MongoError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        let mapped = map_error(reset);
        assert!(matches!(mapped, StoreError::Disconnected(_)));
        assert_eq!(store.classify(&mapped), ErrorClass::Connection);

        let command: CommandError = mongodb::bson::from_document(doc! {
            "code": 2,
            "codeName": "BadValue",
            "errmsg": "unknown operator: $percentile",
        })
        .unwrap();
        let mapped = map_error(MongoError::from(ErrorKind::Command(command)));
        assert!(matches!(mapped, StoreError::Query(_)));
        assert_eq!(store.classify(&mapped), ErrorClass::Query);
    }

    #[test]
    fn dates_are_utc_midnight() {
        let d = bson_date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(d.timestamp_millis(), 1_704_153_600_000);
    }

    #[test]
    fn open_requires_uri() {
        assert!(open(&ConnectOptions::default()).is_err());
        let store = open(&ConnectOptions::default().with("uri", "mongodb://localhost:27017")).unwrap();
        assert_eq!(store.name(), "mongodb");
    }
}
