pub mod counter;
pub mod dtos;
pub mod observer;
pub mod opgate;
pub mod recipes;
pub mod telemetry;

pub use counter::ImpressionsCounter;
pub use dtos::{
    Event, FeatureCount, Impression, ImpressionCounts, Metadata, MySegment, SegmentChanges, Split,
    SplitChanges, SplitStatus, TestImpressions,
};
pub use observer::ImpressionObserver;
pub use opgate::{OperationBusy, OperationGate, OperationKind};
pub use recipes::{ChangeSummaries, ChangeSummary, SummaryNotCached};
pub use telemetry::{Endpoint, ProxyTelemetry, TimeSliceReport};
