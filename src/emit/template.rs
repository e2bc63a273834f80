//! The embedded interpreter template.
//!
//! Pure Lua 5.1: no bitwise operators, no goto, nothing outside the base
//! library. The opcode dispatch below implements the instruction table in
//! `bytecode::instruction` in enum order; the two must be versioned
//! together with the packer layout.
//!
//! The emitter prepends `local LV_PAYLOAD = "<base64>"` and
//! `local LV_SEED = <n>` and appends the boot call; everything else is
//! fixed text.

/// The interpreter body. Expects `LV_PAYLOAD` and `LV_SEED` to be in scope.
pub const INTERPRETER: &str = r##"
local lv_byte = string.byte
local lv_char = string.char
local lv_sub = string.sub
local lv_concat = table.concat
local lv_floor = math.floor
local lv_unpack = unpack
local lv_select = select
local lv_globals = _G
local lv_b64 = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/"

local function lv_decode(data)
  local map = {}
  for i = 1, 64 do
    map[lv_byte(lv_b64, i)] = i - 1
  end
  local out = {}
  local buffer = 0
  local bits = 0
  for i = 1, #data do
    local v = map[lv_byte(data, i)]
    if v then
      buffer = buffer * 64 + v
      bits = bits + 6
      if bits >= 8 then
        bits = bits - 8
        local unit = 2 ^ bits
        out[#out + 1] = lv_char(lv_floor(buffer / unit) % 256)
        buffer = buffer % unit
      end
    end
  end
  return lv_concat(out)
end

local function lv_decipher(data, seed)
  local state = seed % 65521
  if state < 1 then
    state = 1
  end
  local out = {}
  for i = 1, #data do
    state = (state * 251 + 13) % 65521
    out[i] = lv_char((lv_byte(data, i) - state % 256) % 256)
  end
  return lv_concat(out)
end

local function lv_reader(data)
  local r = { pos = 1 }
  function r.u8()
    local v = lv_byte(data, r.pos)
    r.pos = r.pos + 1
    return v
  end
  function r.u32()
    local a = r.u8()
    local b = r.u8()
    local c = r.u8()
    local d = r.u8()
    return a + b * 256 + c * 65536 + d * 16777216
  end
  function r.f64()
    local b1 = r.u8()
    local b2 = r.u8()
    local b3 = r.u8()
    local b4 = r.u8()
    local b5 = r.u8()
    local b6 = r.u8()
    local b7 = r.u8()
    local b8 = r.u8()
    local sign = 1
    if b8 >= 128 then
      sign = -1
      b8 = b8 - 128
    end
    local expo = b8 * 16 + lv_floor(b7 / 16)
    local mant = ((((((b7 % 16) * 256 + b6) * 256 + b5) * 256 + b4) * 256 + b3) * 256 + b2) * 256 + b1
    if expo == 0 then
      if mant == 0 then
        return 0 * sign
      end
      return sign * mant * 2 ^ -1074
    end
    if expo == 2047 then
      if mant == 0 then
        return sign * (1 / 0)
      end
      return 0 / 0
    end
    return sign * (1 + mant / 4503599627370496) * 2 ^ (expo - 1023)
  end
  function r.str(n)
    local s = lv_sub(data, r.pos, r.pos + n - 1)
    r.pos = r.pos + n
    return s
  end
  return r
end

local function lv_read_proto(r)
  local proto = {}
  proto.num_params = r.u8()
  proto.is_vararg = r.u8()
  proto.max_stack = r.u8()
  local nup = r.u8()
  proto.upvals = {}
  for i = 1, nup do
    local is_local = r.u8()
    local index = r.u8()
    proto.upvals[i] = { is_local, index }
  end
  local nk = r.u32()
  proto.consts = {}
  for i = 1, nk do
    local tag = r.u8()
    if tag == 0 then
      proto.consts[i] = {}
    elseif tag == 1 then
      proto.consts[i] = { r.u8() == 1 }
    elseif tag == 2 then
      proto.consts[i] = { r.f64() }
    else
      proto.consts[i] = { r.str(r.u32()) }
    end
  end
  local ni = r.u32()
  proto.code = {}
  for i = 1, ni do
    local op = r.u8()
    local a = r.u8()
    local b = r.u32()
    local c = r.u32()
    proto.code[i] = { op, a, b, c }
  end
  local np = r.u32()
  proto.protos = {}
  for i = 1, np do
    proto.protos[i] = lv_read_proto(r)
  end
  return proto
end

local function lv_pack(...)
  return { ... }, lv_select("#", ...)
end

local lv_run
local function lv_closure(proto, upvals)
  return function(...)
    local args = { ... }
    local nargs = lv_select("#", ...)
    local results, count = lv_run(proto, upvals, args, nargs)
    return lv_unpack(results, 1, count)
  end
end

lv_run = function(proto, upvals, args, nargs)
  local code = proto.code
  local consts = proto.consts
  local protos = proto.protos
  local num_params = proto.num_params
  local R = {}
  local open = {}
  for i = 1, num_params do
    R[i - 1] = args[i]
  end
  local varargs = {}
  local nvarargs = 0
  if proto.is_vararg == 1 then
    local i = num_params + 1
    while i <= nargs do
      nvarargs = nvarargs + 1
      varargs[nvarargs] = args[i]
      i = i + 1
    end
  end
  local pc = 1
  local top = 0
  while true do
    local ins = code[pc]
    pc = pc + 1
    local op = ins[1]
    local a = ins[2]
    local b = ins[3]
    local c = ins[4]
    if op == 0 then
      R[a] = R[b]
    elseif op == 1 then
      R[a] = consts[b + 1][1]
    elseif op == 2 then
      R[a] = b == 1
    elseif op == 3 then
      for i = a, b do
        R[i] = nil
      end
    elseif op == 4 then
      R[a] = lv_globals[consts[b + 1][1]]
    elseif op == 5 then
      lv_globals[consts[b + 1][1]] = R[a]
    elseif op == 6 then
      local uv = upvals[b + 1]
      R[a] = uv.s[uv.i]
    elseif op == 7 then
      local uv = upvals[b + 1]
      uv.s[uv.i] = R[a]
    elseif op == 8 then
      R[a] = R[b][R[c]]
    elseif op == 9 then
      R[a][R[b]] = R[c]
    elseif op == 10 then
      R[a] = {}
    elseif op == 11 then
      local obj = R[b]
      R[a + 1] = obj
      R[a] = obj[consts[c + 1][1]]
    elseif op == 12 then
      R[a] = R[b] + R[c]
    elseif op == 13 then
      R[a] = R[b] - R[c]
    elseif op == 14 then
      R[a] = R[b] * R[c]
    elseif op == 15 then
      R[a] = R[b] / R[c]
    elseif op == 16 then
      R[a] = R[b] % R[c]
    elseif op == 17 then
      R[a] = R[b] ^ R[c]
    elseif op == 18 then
      R[a] = R[b] .. R[c]
    elseif op == 19 then
      R[a] = -R[b]
    elseif op == 20 then
      R[a] = not R[b]
    elseif op == 21 then
      R[a] = #R[b]
    elseif op == 22 then
      R[a] = R[b] == R[c]
    elseif op == 23 then
      R[a] = R[b] < R[c]
    elseif op == 24 then
      R[a] = R[b] <= R[c]
    elseif op == 25 then
      pc = b + 1
    elseif op == 26 then
      local truthy = not not R[a]
      if truthy == (c == 1) then
        pc = b + 1
      end
    elseif op == 27 then
      local cargs = {}
      local n
      if b == 0 then
        n = top - a - 1
      else
        n = b - 1
      end
      for i = 1, n do
        cargs[i] = R[a + i]
      end
      local results, count = lv_pack(R[a](lv_unpack(cargs, 1, n)))
      if c == 0 then
        for i = 1, count do
          R[a + i - 1] = results[i]
        end
        top = a + count
      else
        for i = 1, c - 1 do
          R[a + i - 1] = results[i]
        end
      end
    elseif op == 28 then
      local n
      if b == 0 then
        n = top - a
      else
        n = b - 1
      end
      local out = {}
      for i = 1, n do
        out[i] = R[a + i - 1]
      end
      return out, n
    elseif op == 29 then
      if b == 0 then
        for i = 1, nvarargs do
          R[a + i - 1] = varargs[i]
        end
        top = a + nvarargs
      else
        for i = 1, b - 1 do
          R[a + i - 1] = varargs[i]
        end
      end
    elseif op == 30 then
      local p = protos[b + 1]
      local descriptors = p.upvals
      local ups = {}
      for i = 1, #descriptors do
        local d = descriptors[i]
        if d[1] == 1 then
          local slot = d[2]
          local uv = open[slot]
          if not uv then
            uv = { s = R, i = slot }
            open[slot] = uv
          end
          ups[i] = uv
        else
          ups[i] = upvals[d[2] + 1]
        end
      end
      R[a] = lv_closure(p, ups)
    elseif op == 31 then
      for i = a, proto.max_stack do
        local uv = open[i]
        if uv then
          uv.s = { [uv.i] = R[i] }
          open[i] = nil
        end
      end
    elseif op == 32 then
      local init = tonumber(R[a])
      local limit = tonumber(R[a + 1])
      local step = tonumber(R[a + 2])
      if not init then
        error("'for' initial value must be a number")
      end
      if not limit then
        error("'for' limit must be a number")
      end
      if not step then
        error("'for' step must be a number")
      end
      R[a] = init - step
      R[a + 1] = limit
      R[a + 2] = step
      pc = b + 1
    elseif op == 33 then
      local step = R[a + 2]
      local idx = R[a] + step
      R[a] = idx
      local limit = R[a + 1]
      local continues
      if step > 0 then
        continues = idx <= limit
      else
        continues = idx >= limit
      end
      if continues then
        R[a + 3] = idx
        pc = b + 1
      end
    elseif op == 34 then
      local results, count = lv_pack(R[a](R[a + 1], R[a + 2]))
      for i = 1, b do
        R[a + 2 + i] = results[i]
      end
      if results[1] == nil then
        pc = c + 1
      else
        R[a + 2] = results[1]
      end
    elseif op == 35 then
      local t = R[a]
      local idx = c
      local i = b
      while i < top do
        t[idx] = R[i]
        idx = idx + 1
        i = i + 1
      end
    else
      error("bad opcode")
    end
  end
end

local function lv_boot(payload, seed, ...)
  local raw = lv_decode(payload)
  if lv_sub(raw, 1, 4) ~= "LVBC" then
    error("corrupt payload")
  end
  if lv_byte(raw, 5) ~= 1 then
    error("unsupported payload version")
  end
  local flags = lv_byte(raw, 6)
  local body = lv_sub(raw, 7)
  if flags % 2 == 1 then
    body = lv_decipher(body, seed)
  end
  local root = lv_read_proto(lv_reader(body))
  local main = lv_closure(root, {})
  return main(...)
end

return lv_boot(LV_PAYLOAD, LV_SEED, ...)
"##;
