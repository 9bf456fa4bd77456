use std::path::PathBuf;

use tempfile::TempDir;

/// Four agents: 0 first, 1 and 2 after 0, 3 after both.
/// Agent 1 writes `left`, agent 2 writes `right`, agent 3 reads both.
pub const DIAMOND_PLAN: &str = r#"
<root>
  <name>Diamond</name>
  <thought>Fan out after the first agent and join at the end.</thought>
  <agents>
    <agent name="Chat" id="0" dependsOn="">
      <task>Collect the seed</task>
      <nodes>
        <node output="seed">Produce the seed value</node>
      </nodes>
    </agent>
    <agent name="Chat" id="1" dependsOn="0">
      <task>Left branch</task>
      <nodes>
        <node input="seed" output="left">Derive left from seed</node>
      </nodes>
    </agent>
    <agent name="Chat" id="2" dependsOn="0">
      <task>Right branch</task>
      <nodes>
        <node input="seed" output="right">Derive right from seed</node>
      </nodes>
    </agent>
    <agent name="Chat" id="3" dependsOn="1,2">
      <task>Join</task>
      <nodes>
        <node input="left">Combine left</node>
        <node input="right">Combine right</node>
      </nodes>
    </agent>
  </agents>
</root>
"#;

/// One browser agent looping over three literal items.
pub const FOREACH_PLAN: &str = r#"
<root>
  <name>Loop</name>
  <thought>Visit each product.</thought>
  <agents>
    <agent name="Browser" id="0">
      <task>Open every product page</task>
      <nodes>
        <node>Open the catalogue</node>
        <forEach items='["alpha","beta","gamma"]'>
          <node output="last_visited">Open the product page</node>
        </forEach>
      </nodes>
    </agent>
  </agents>
</root>
"#;

/// Write `contents` to a `weft.toml` inside a fresh temp directory.
pub fn temp_config(contents: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("weft.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}
