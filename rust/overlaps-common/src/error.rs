// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

/// Macro to create an internal error for invariant violations inside the overlaps
/// join build that avoids the misleading error message from DataFusionError::Internal.
#[macro_export]
macro_rules! overlaps_internal_err {
    ($($args:expr),*) => {{
        let msg = std::format!(
            "Overlaps join internal error: {}{}.\nThis issue was likely caused by a bug in the \
            overlaps hash table builder. Please file a bug report with the query and the hints used",
            std::format!($($args),*),
            datafusion_common::DataFusionError::get_back_trace(),
        );
        // Not Internal: that variant points users at the DataFusion issue tracker
        Err(datafusion_common::DataFusionError::External(msg.into()))
    }};
}

#[cfg(test)]
mod tests {
    use datafusion_common::DataFusionError;

    #[test]
    fn test_overlaps_internal_err() {
        let result: Result<(), DataFusionError> =
            overlaps_internal_err!("Missing device {}", 3);
        assert!(result.is_err());
        let err_string = result.unwrap_err().to_string();
        assert!(err_string.contains("Overlaps join internal error: Missing device 3"));
        assert!(!err_string.contains("DataFusion's code"));
        assert!(!err_string.contains("https://github.com/apache/datafusion/issues"));
    }
}
