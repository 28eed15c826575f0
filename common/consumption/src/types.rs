use std::collections::HashMap;

use rdkafka::message::{Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// Ordered, duplicate-free list of topics an engine consumes from.
///
/// Duplicates collapse onto their first occurrence so the broker sees each
/// topic once, in the order the caller listed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topics: Vec<String>,
}

impl Subscription {
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut deduped: Vec<String> = Vec::new();
        for topic in topics {
            let topic = topic.into();
            if !deduped.contains(&topic) {
                deduped.push(topic);
            }
        }
        Self { topics: deduped }
    }

    /// Parse a comma separated topic list, as found in env config.
    pub fn from_csv(topics: &str) -> Self {
        Self::new(
            topics
                .split(',')
                .map(str::trim)
                .filter(|topic| !topic.is_empty()),
        )
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn topic_refs(&self) -> Vec<&str> {
        self.topics.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Consumer group membership as reported by the broker client
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupIdentity {
    pub group_id: String,
    pub member_id: Option<String>,
}

impl GroupIdentity {
    pub fn new(group_id: impl Into<String>, member_id: Option<String>) -> Self {
        Self {
            group_id: group_id.into(),
            member_id,
        }
    }

    /// Member id for log lines, "unknown" until the client reports one.
    pub fn member_id_or_unknown(&self) -> &str {
        self.member_id.as_deref().unwrap_or("unknown")
    }
}

/// A set of partitions and the group member that owns them, as seen during
/// a single rebalance callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    member: GroupIdentity,
    partitions: Vec<Partition>,
}

impl PartitionAssignment {
    pub fn new(member: GroupIdentity, partitions: Vec<Partition>) -> Self {
        Self { member, partitions }
    }

    pub fn member(&self) -> &GroupIdentity {
        &self.member
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// A single delivered record. Fields are read-only once the broker client
/// has handed the record to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    partition: Partition,
    offset: i64,
    timestamp: Option<i64>,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    headers: HashMap<String, Vec<u8>>,
}

impl Record {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            partition: Partition::new(topic.into(), partition),
            offset,
            timestamp: None,
            key: None,
            value: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Copy a broker message into an owned record. Headers without a value
    /// are kept with an empty value; repeated header names keep the last one.
    pub fn from_message<M: Message>(message: &M) -> Self {
        let mut headers = HashMap::new();
        if let Some(message_headers) = message.headers() {
            for header in message_headers.iter() {
                headers.insert(
                    header.key.to_string(),
                    header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                );
            }
        }

        Self {
            partition: Partition::new(message.topic().to_string(), message.partition()),
            offset: message.offset(),
            timestamp: message.timestamp().to_millis(),
            key: message.key().map(<[u8]>::to_vec),
            value: message.payload().map(<[u8]>::to_vec),
            headers,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(Vec::as_slice)
    }

    pub fn headers(&self) -> &HashMap<String, Vec<u8>> {
        &self.headers
    }
}
