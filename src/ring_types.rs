/// One field value of a line-protocol record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
}

/// A fully decoded write: one row destined for `table`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    pub table: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    /// Nanoseconds since the epoch, when the client supplied one.
    pub timestamp: Option<i64>,
}

impl Measurement {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Entry in a writer's ring buffer. Pre-allocated per slot via factory.
/// Network threads fill these in the publish closure; the owning writer reads them.
pub struct MeasurementEvent {
    pub worker_id: u16,
    pub connection_id: u64,
    pub measurement: Measurement,
}

impl MeasurementEvent {
    /// Factory for disruptor - creates empty events that will be filled with real data.
    pub fn factory() -> Self {
        Self {
            worker_id: 0,
            connection_id: 0,
            measurement: Measurement::default(),
        }
    }
}
